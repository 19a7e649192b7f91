//! Scan pipeline and the capture-loop state machine.
//!
//! One scan runs start to finish before the next frame is read:
//! timetable → face crop → embedding → gallery match → attendance report.

use crate::crop::DEFAULT_FACE_PADDING;
use crate::gallery::Gallery;
use crate::pipeline::{
    extract_face, AttendanceReporter, Command, CommandSource, FaceDetector, FaceEmbedder, FrameSource,
};
use crate::schedule::{Clock, Timetable};
use crate::types::{AttendanceRecord, FirstAboveThreshold, MatchResult, Matcher};
use image::RgbImage;
use std::time::Duration;
use thiserror::Error;

/// Cosine similarity a probe must strictly exceed to count as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("face detection failed: {0}")]
    Detector(Box<dyn std::error::Error + Send + Sync>),
    #[error("embedding failed: {0}")]
    Embedder(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum CaptureError<E: std::error::Error + 'static> {
    #[error("failed to grab frame: {0}")]
    FrameUnavailable(#[source] E),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSettings {
    pub threshold: f32,
    pub padding: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            padding: DEFAULT_FACE_PADDING,
        }
    }
}

/// How a single scan ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// No activity is in session; nothing else was attempted.
    NothingScheduled,
    /// The frame held no usable face.
    NoFace { activity: String },
    /// A face was embedded but no gallery entry cleared the threshold.
    NoMatch { activity: String, best: MatchResult },
    /// A gallery entry matched. `reported` is false when the attendance
    /// service did not acknowledge the record.
    Matched {
        record: AttendanceRecord,
        similarity: f32,
        reported: bool,
    },
}

/// Everything needed to turn one frame into an attendance record.
pub struct Scanner<D, E, R, C> {
    detector: D,
    embedder: E,
    reporter: R,
    clock: C,
    gallery: Gallery,
    timetable: Timetable,
    settings: ScanSettings,
}

impl<D, E, R, C> Scanner<D, E, R, C>
where
    D: FaceDetector,
    E: FaceEmbedder,
    R: AttendanceReporter,
    C: Clock,
{
    pub fn new(
        detector: D,
        embedder: E,
        reporter: R,
        clock: C,
        gallery: Gallery,
        timetable: Timetable,
        settings: ScanSettings,
    ) -> Self {
        Self {
            detector,
            embedder,
            reporter,
            clock,
            gallery,
            timetable,
            settings,
        }
    }

    #[cfg(test)]
    pub(crate) fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    #[cfg(test)]
    pub(crate) fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Activity in session right now, if any.
    pub fn current_activity(&self) -> Option<&str> {
        self.timetable.lookup(self.clock.now())
    }

    /// Detect, embed and match the face in `frame` without consulting the
    /// timetable or reporting.
    pub fn identify(&mut self, frame: &RgbImage) -> Result<Option<MatchResult>, ScanError> {
        let size = self.embedder.input_size();
        let Some(face) = extract_face(&mut self.detector, frame, self.settings.padding, size)
            .map_err(|e| ScanError::Detector(Box::new(e)))?
        else {
            return Ok(None);
        };

        let probe = self
            .embedder
            .embed(&face)
            .map_err(|e| ScanError::Embedder(Box::new(e)))?;

        Ok(Some(FirstAboveThreshold.compare(
            &probe,
            self.gallery.entries(),
            self.settings.threshold,
        )))
    }

    /// Run one full scan on `frame`.
    pub fn scan(&mut self, frame: &RgbImage) -> Result<ScanOutcome, ScanError> {
        let Some(activity) = self.current_activity().map(str::to_string) else {
            tracing::warn!("no activity scheduled at this time");
            return Ok(ScanOutcome::NothingScheduled);
        };
        tracing::info!(%activity, "period in session");

        let Some(result) = self.identify(frame)? else {
            tracing::warn!("no face detected; try again with better lighting or a clearer view");
            return Ok(ScanOutcome::NoFace { activity });
        };

        let (true, Some(identity)) = (result.matched, result.identity.clone()) else {
            tracing::warn!(
                closest = ?result.identity,
                similarity = result.similarity,
                "no match found; try scanning again"
            );
            return Ok(ScanOutcome::NoMatch { activity, best: result });
        };

        tracing::info!(%identity, similarity = result.similarity, "match found");
        let record = AttendanceRecord {
            reg_no: identity,
            subject: activity,
        };
        let reported = match self.reporter.report(&record) {
            Ok(()) => {
                tracing::info!(reg_no = %record.reg_no, subject = %record.subject, "attendance marked");
                true
            }
            Err(e) => {
                tracing::error!(reg_no = %record.reg_no, error = %e, "failed to mark attendance");
                false
            }
        };

        Ok(ScanOutcome::Matched {
            record,
            similarity: result.similarity,
            reported,
        })
    }
}

/// Operator-visible state of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Scanning,
    Quitting,
}

/// Counters reported when the capture loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub frames: u64,
    pub scans: u64,
    pub matches: u64,
    pub reported: u64,
}

/// Single-threaded loop: read a frame, poll one command, maybe scan, sleep.
pub struct CaptureLoop<D, E, R, C> {
    scanner: Scanner<D, E, R, C>,
    poll_interval: Duration,
    state: LoopState,
    summary: LoopSummary,
}

impl<D, E, R, C> CaptureLoop<D, E, R, C>
where
    D: FaceDetector,
    E: FaceEmbedder,
    R: AttendanceReporter,
    C: Clock,
{
    pub fn new(scanner: Scanner<D, E, R, C>, poll_interval: Duration) -> Self {
        Self {
            scanner,
            poll_interval,
            state: LoopState::Idle,
            summary: LoopSummary::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn summary(&self) -> LoopSummary {
        self.summary
    }

    #[cfg(test)]
    pub(crate) fn scanner(&self) -> &Scanner<D, E, R, C> {
        &self.scanner
    }

    /// Drive the loop until a quit command or a frame failure.
    ///
    /// A failed frame read ends the loop with an error; every other problem
    /// is logged and the loop returns to `Idle`.
    pub fn run<F, K>(&mut self, frames: &mut F, commands: &mut K) -> Result<LoopSummary, CaptureError<F::Error>>
    where
        F: FrameSource,
        K: CommandSource,
    {
        tracing::info!("scanner ready; 's' to scan, 'q' to quit");

        while self.state != LoopState::Quitting {
            self.tick(frames, commands)?;
            if self.state == LoopState::Idle && !self.poll_interval.is_zero() {
                std::thread::sleep(self.poll_interval);
            }
        }

        tracing::info!(summary = ?self.summary, "scanner stopped");
        Ok(self.summary)
    }

    /// One iteration: a frame, at most one command, and its scan if requested.
    pub fn tick<F, K>(&mut self, frames: &mut F, commands: &mut K) -> Result<LoopState, CaptureError<F::Error>>
    where
        F: FrameSource,
        K: CommandSource,
    {
        let frame = frames.next_frame().map_err(CaptureError::FrameUnavailable)?;
        self.summary.frames += 1;

        match commands.poll() {
            Some(Command::Quit) => {
                tracing::info!("quitting scanner");
                self.state = LoopState::Quitting;
            }
            Some(Command::Scan) => {
                self.state = LoopState::Scanning;
                self.summary.scans += 1;
                self.run_scan(&frame);
                self.state = LoopState::Idle;
            }
            None => {}
        }

        Ok(self.state)
    }

    fn run_scan(&mut self, frame: &RgbImage) {
        match self.scanner.scan(frame) {
            Ok(ScanOutcome::Matched { reported, .. }) => {
                self.summary.matches += 1;
                if reported {
                    self.summary.reported += 1;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "scan aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::*;
    use crate::pipeline::ReportError;
    use crate::schedule::{parse_clock_time, FixedClock};
    use crate::types::{DetectionBox, Embedding, GalleryEntry};
    use image::Rgb;
    use std::path::PathBuf;

    const SIZE: u32 = 8;

    fn clock(hhmm: &str) -> FixedClock {
        FixedClock(parse_clock_time(hhmm).unwrap())
    }

    fn entry(identity: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity: identity.into(),
            embedding: Embedding::new(values),
            source: PathBuf::from(format!("{identity}.png")),
        }
    }

    /// Gallery keyed to `MeanColorEmbedder`: a pure-red face matches "RED01".
    fn color_gallery() -> Gallery {
        Gallery::new(vec![
            entry("GREEN01", vec![0.0, 1.0, 0.0]),
            entry("RED01", vec![1.0, 0.0, 0.0]),
        ])
    }

    fn red_frame() -> RgbImage {
        RgbImage::from_pixel(120, 90, Rgb([255, 0, 0]))
    }

    fn face_box() -> DetectionBox {
        DetectionBox { x: 40.0, y: 30.0, width: 30.0, height: 30.0, confidence: 0.99 }
    }

    fn scanner<R: AttendanceReporter>(
        faces: Vec<DetectionBox>,
        reporter: R,
        at: &str,
    ) -> Scanner<FakeDetector, MeanColorEmbedder, R, FixedClock> {
        Scanner::new(
            FakeDetector::with_faces(faces),
            MeanColorEmbedder::new(SIZE),
            reporter,
            clock(at),
            color_gallery(),
            Timetable::default(),
            ScanSettings::default(),
        )
    }

    #[test]
    fn test_scan_match_reports_attendance() {
        let mut s = scanner(vec![face_box()], RecordingReporter::ok(), "09:30");
        let outcome = s.scan(&red_frame()).unwrap();

        let expected = AttendanceRecord {
            reg_no: "RED01".into(),
            subject: "Software Construction".into(),
        };
        match outcome {
            ScanOutcome::Matched { record, similarity, reported } => {
                assert_eq!(record, expected);
                assert!((similarity - 1.0).abs() < 1e-5);
                assert!(reported);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*s.reporter().sent.borrow(), vec![expected]);
    }

    #[test]
    fn test_scan_outside_timetable_skips_detection() {
        let mut s = scanner(vec![face_box()], RecordingReporter::ok(), "08:00");
        assert_eq!(s.scan(&red_frame()).unwrap(), ScanOutcome::NothingScheduled);
        assert_eq!(s.detector.calls, 0);
        assert!(s.reporter().sent.borrow().is_empty());
    }

    #[test]
    fn test_scan_without_face() {
        let mut s = scanner(vec![], RecordingReporter::ok(), "10:30");
        assert_eq!(
            s.scan(&red_frame()).unwrap(),
            ScanOutcome::NoFace { activity: "DBMS".into() }
        );
        assert!(s.reporter().sent.borrow().is_empty());
    }

    #[test]
    fn test_scan_no_match_does_not_report() {
        let mut s = scanner(vec![face_box()], RecordingReporter::ok(), "11:30");
        let blue = RgbImage::from_pixel(120, 90, Rgb([0, 0, 255]));

        match s.scan(&blue).unwrap() {
            ScanOutcome::NoMatch { activity, best } => {
                assert_eq!(activity, "AI");
                assert!(!best.matched);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(s.reporter().sent.borrow().is_empty());
    }

    #[test]
    fn test_rejected_report_keeps_state() {
        let reporter = RecordingReporter::failing(ReportError::Rejected {
            status: 404,
            body: "Student not found".into(),
        });
        let mut s = scanner(vec![face_box()], reporter, "13:15");
        let before: Vec<String> = s.gallery().identities().map(str::to_string).collect();

        match s.scan(&red_frame()).unwrap() {
            ScanOutcome::Matched { record, reported, .. } => {
                assert_eq!(record.reg_no, "RED01");
                assert!(!reported);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let after: Vec<String> = s.gallery().identities().map(str::to_string).collect();
        assert_eq!(before, after);
        assert_eq!(s.reporter().sent.borrow().len(), 1);

        // A second scan behaves identically: nothing was latched by the failure.
        assert!(matches!(s.scan(&red_frame()).unwrap(), ScanOutcome::Matched { .. }));
        assert_eq!(s.reporter().sent.borrow().len(), 2);
    }

    #[test]
    fn test_scan_detector_failure_is_scan_error() {
        let mut s = scanner(vec![face_box()], RecordingReporter::ok(), "09:30");
        s.detector.fail = true;
        assert!(matches!(s.scan(&red_frame()), Err(ScanError::Detector(_))));
    }

    #[test]
    fn test_loop_scan_then_quit() {
        let mut capture = CaptureLoop::new(
            scanner(vec![face_box()], RecordingReporter::ok(), "14:30"),
            Duration::ZERO,
        );
        let mut frames = ScriptedFrames { frame: red_frame(), remaining: 10 };
        let mut commands = ScriptedCommands::new([None, Some(Command::Scan), None, Some(Command::Quit)]);

        let summary = capture.run(&mut frames, &mut commands).unwrap();

        assert_eq!(capture.state(), LoopState::Quitting);
        assert_eq!(summary, LoopSummary { frames: 4, scans: 1, matches: 1, reported: 1 });
        let sent = capture.scanner().reporter().sent.borrow();
        assert_eq!(sent[0].subject, "Operating Systems");
    }

    #[test]
    fn test_loop_frame_failure_is_fatal() {
        let mut capture = CaptureLoop::new(
            scanner(vec![face_box()], RecordingReporter::ok(), "14:30"),
            Duration::ZERO,
        );
        let mut frames = ScriptedFrames { frame: red_frame(), remaining: 2 };
        let mut commands = ScriptedCommands::new([]);

        let err = capture.run(&mut frames, &mut commands).unwrap_err();
        assert!(matches!(err, CaptureError::FrameUnavailable(_)));
        assert_eq!(capture.summary().frames, 2);
    }

    #[test]
    fn test_loop_returns_to_idle_after_each_scan_outcome() {
        let mut capture = CaptureLoop::new(
            scanner(vec![], RecordingReporter::ok(), "16:00"),
            Duration::ZERO,
        );
        let mut frames = ScriptedFrames { frame: red_frame(), remaining: 10 };
        let mut commands = ScriptedCommands::new([Some(Command::Scan)]);

        // Nothing scheduled at 16:00.
        assert_eq!(capture.tick(&mut frames, &mut commands).unwrap(), LoopState::Idle);
        // No command this time.
        assert_eq!(capture.tick(&mut frames, &mut commands).unwrap(), LoopState::Idle);
        assert_eq!(capture.summary().scans, 1);
        assert_eq!(capture.summary().matches, 0);
    }

    #[test]
    fn test_loop_survives_scan_error() {
        let mut s = scanner(vec![face_box()], RecordingReporter::ok(), "09:30");
        s.detector.fail = true;
        let mut capture = CaptureLoop::new(s, Duration::ZERO);
        let mut frames = ScriptedFrames { frame: red_frame(), remaining: 10 };
        let mut commands = ScriptedCommands::new([Some(Command::Scan), Some(Command::Quit)]);

        let summary = capture.run(&mut frames, &mut commands).unwrap();
        assert_eq!(summary.scans, 1);
        assert_eq!(summary.matches, 0);
    }
}
