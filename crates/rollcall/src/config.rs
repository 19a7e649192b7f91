use rollcall_core::scanner::DEFAULT_SIMILARITY_THRESHOLD;
use rollcall_core::crop::DEFAULT_FACE_PADDING;
use rollcall_core::{ScanSettings, Timetable, TimetableError};
use rollcall_models::{FACENET_EMBEDDING_OUTPUT, FACENET_INPUT_SIZE, SCRFD_DEFAULT_CONFIDENCE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("timetable: {0}")]
    Timetable(#[from] TimetableError),
    #[error("{key} = {value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Scanner configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables. Every scalar key has an override named
/// after it in upper case (`frame_width` is `ROLLCALL_FRAME_WIDTH`); the
/// timetable is file-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture size; the driver may pick another.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames discarded after the camera opens (auto-exposure settling).
    pub warmup_frames: usize,
    /// Delay between capture-loop ticks.
    pub poll_interval_ms: u64,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    /// Name of the embedder output tensor holding the embedding.
    pub embedding_output: String,
    pub embedder_input_size: u32,
    pub detector_confidence: f32,
    /// Directory of `<reg_no>.jpg` / `<reg_no>.png` reference photos.
    pub gallery_dir: PathBuf,
    pub attendance_endpoint: String,
    /// Cosine similarity a face must strictly exceed to match.
    pub similarity_threshold: f32,
    /// Pixels added around each detection before cropping.
    pub face_padding: u32,
    /// Unset means the attendance request may block indefinitely.
    pub report_timeout_secs: Option<u64>,
    /// `"HH:MM-HH:MM" = "activity"`; the built-in table when absent.
    pub timetable: Option<BTreeMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            warmup_frames: 4,
            poll_interval_ms: 10,
            model_dir: default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "facenet.onnx".to_string(),
            embedding_output: FACENET_EMBEDDING_OUTPUT.to_string(),
            embedder_input_size: FACENET_INPUT_SIZE,
            detector_confidence: SCRFD_DEFAULT_CONFIDENCE,
            gallery_dir: PathBuf::from("uploads"),
            attendance_endpoint: "http://localhost:5000/attendance/mark".to_string(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            face_padding: DEFAULT_FACE_PADDING,
            report_timeout_secs: None,
            timetable: None,
        }
    }
}

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

impl Config {
    /// Load configuration from an optional TOML file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let env = EnvLookup(var);
        env.string("ROLLCALL_CAMERA_DEVICE", &mut self.camera_device);
        env.parse("ROLLCALL_FRAME_WIDTH", &mut self.frame_width);
        env.parse("ROLLCALL_FRAME_HEIGHT", &mut self.frame_height);
        env.parse("ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env.parse("ROLLCALL_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env.path("ROLLCALL_MODEL_DIR", &mut self.model_dir);
        env.string("ROLLCALL_DETECTOR_MODEL", &mut self.detector_model);
        env.string("ROLLCALL_EMBEDDER_MODEL", &mut self.embedder_model);
        env.string("ROLLCALL_EMBEDDING_OUTPUT", &mut self.embedding_output);
        env.parse("ROLLCALL_EMBEDDER_INPUT_SIZE", &mut self.embedder_input_size);
        env.parse("ROLLCALL_DETECTOR_CONFIDENCE", &mut self.detector_confidence);
        env.path("ROLLCALL_GALLERY_DIR", &mut self.gallery_dir);
        env.string("ROLLCALL_ATTENDANCE_ENDPOINT", &mut self.attendance_endpoint);
        env.parse("ROLLCALL_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env.parse("ROLLCALL_FACE_PADDING", &mut self.face_padding);
        if let Some(secs) = env.get("ROLLCALL_REPORT_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.report_timeout_secs = Some(secs),
                Err(_) => tracing::warn!(value = %secs, "ignoring invalid ROLLCALL_REPORT_TIMEOUT_SECS"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid {
                key: "similarity_threshold",
                value: self.similarity_threshold.to_string(),
                reason: "must lie in [-1, 1]",
            });
        }
        if !(0.0..=1.0).contains(&self.detector_confidence) {
            return Err(ConfigError::Invalid {
                key: "detector_confidence",
                value: self.detector_confidence.to_string(),
                reason: "must lie in [0, 1]",
            });
        }
        if self.embedder_input_size == 0 {
            return Err(ConfigError::Invalid {
                key: "embedder_input_size",
                value: "0".to_string(),
                reason: "must be positive",
            });
        }
        self.timetable()?;
        Ok(())
    }

    pub fn timetable(&self) -> Result<Timetable, ConfigError> {
        match &self.timetable {
            Some(table) => Ok(Timetable::from_pairs(table.iter().map(|(k, v)| (k, v.clone())))?),
            None => Ok(Timetable::default()),
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            threshold: self.similarity_threshold,
            padding: self.face_padding,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_timeout(&self) -> Option<Duration> {
        self.report_timeout_secs.map(Duration::from_secs)
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }
}

struct EnvLookup<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvLookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, field: &mut String) {
        if let Some(v) = self.get(key) {
            *field = v;
        }
    }

    fn path(&self, key: &str, field: &mut PathBuf) {
        if let Some(v) = self.get(key) {
            *field = PathBuf::from(v);
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, field: &mut T) {
        if let Some(v) = self.get(key) {
            match v.parse() {
                Ok(parsed) => *field = parsed,
                Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable environment override"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.face_padding, 20);
        assert_eq!(config.embedder_input_size, 160);
        assert_eq!(config.embedding_output, "Bottleneck_BatchNorm");
        assert_eq!(config.report_timeout(), None);
        assert_eq!(config.timetable().unwrap(), Timetable::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_partial_override() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video2"
            gallery_dir = "/srv/faces"
            similarity_threshold = 0.7
            report_timeout_secs = 5

            [timetable]
            "08:00-09:00" = "Maths"
            "09:00-10:30" = "Physics"
            "#,
        )
        .unwrap();

        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.gallery_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.report_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.frame_width, 640);

        let table = config.timetable().unwrap();
        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.lookup(rollcall_core::schedule::parse_clock_time("10:15").unwrap()), Some("Physics"));
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let sample = Config::from_toml(include_str!("../../../rollcall.sample.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(sample.camera_device, defaults.camera_device);
        assert_eq!(sample.attendance_endpoint, defaults.attendance_endpoint);
        assert_eq!(sample.similarity_threshold, defaults.similarity_threshold);
        assert_eq!(sample.timetable().unwrap(), Timetable::default());
        sample.validate().unwrap();
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        assert!(Config::from_toml("similarity = 0.5").is_err());
    }

    #[test]
    fn test_bad_timetable_fails_validation() {
        let config = Config::from_toml("[timetable]\n\"9-10\" = \"Maths\"\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Timetable(_))));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let config = Config {
            similarity_threshold: 1.5,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "similarity_threshold", .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_CAMERA_DEVICE", "/dev/video4"),
            ("ROLLCALL_SIMILARITY_THRESHOLD", "0.72"),
            ("ROLLCALL_GALLERY_DIR", "/data/uploads"),
            ("ROLLCALL_REPORT_TIMEOUT_SECS", "3"),
            ("ROLLCALL_FACE_PADDING", "not-a-number"),
        ]));

        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.similarity_threshold, 0.72);
        assert_eq!(config.gallery_dir, PathBuf::from("/data/uploads"));
        assert_eq!(config.report_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.face_padding, 20);
    }

    #[test]
    fn test_env_overrides_capture_and_models() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_FRAME_WIDTH", "1280"),
            ("ROLLCALL_FRAME_HEIGHT", "720"),
            ("ROLLCALL_DETECTOR_MODEL", "scrfd_2.5g.onnx"),
            ("ROLLCALL_EMBEDDER_MODEL", "facenet512.onnx"),
            ("ROLLCALL_EMBEDDER_INPUT_SIZE", "182"),
        ]));

        assert_eq!((config.frame_width, config.frame_height), (1280, 720));
        assert_eq!(config.detector_model, "scrfd_2.5g.onnx");
        assert_eq!(config.embedder_model, "facenet512.onnx");
        assert_eq!(config.embedder_input_size, 182);
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/opt/models"),
            ..Config::default()
        };
        assert_eq!(config.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(config.embedder_model_path(), PathBuf::from("/opt/models/facenet.onnx"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/rollcall.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
