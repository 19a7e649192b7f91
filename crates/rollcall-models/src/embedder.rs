//! FaceNet face embedder via ONNX Runtime.
//!
//! Takes a square RGB face crop scaled to [0, 1] in NHWC layout and reads
//! the embedding from one named output tensor of the exported graph.

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{Embedding, FaceEmbedder};
use std::path::Path;
use thiserror::Error;

pub const FACENET_INPUT_SIZE: u32 = 160;
/// Output tensor carrying the embedding in the stock FaceNet export.
pub const FACENET_EMBEDDING_OUTPUT: &str = "Bottleneck_BatchNorm";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model has no output named {name:?} (available: {available:?})")]
    MissingOutput { name: String, available: Vec<String> },
    #[error("face crop is {got:?}, model expects {expected}x{expected}")]
    InputSize { expected: u32, got: (u32, u32) },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-style embedder.
pub struct FaceNetEmbedder {
    session: Session,
    output_name: String,
    input_size: u32,
}

impl FaceNetEmbedder {
    /// Load the model and check that it exposes `output_name`.
    pub fn load(model_path: &Path, output_name: &str, input_size: u32) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?outputs,
            "loaded FaceNet model"
        );

        if !outputs.iter().any(|o| o == output_name) {
            return Err(EmbedderError::MissingOutput {
                name: output_name.to_string(),
                available: outputs,
            });
        }

        Ok(Self {
            session,
            output_name: output_name.to_string(),
            input_size,
        })
    }

    /// Convert an RGB crop into a 1×H×W×3 tensor with values in [0, 1].
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let (w, h) = face.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, h as usize, w as usize, 3));
        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

impl FaceEmbedder for FaceNetEmbedder {
    type Error = EmbedderError;

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        if face.dimensions() != (self.input_size, self.input_size) {
            return Err(EmbedderError::InputSize {
                expected: self.input_size,
                got: face.dimensions(),
            });
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("{}: {e}", self.output_name)))?;

        if raw.is_empty() {
            return Err(EmbedderError::InferenceFailed(format!(
                "{} produced an empty tensor",
                self.output_name
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::new(FACENET_INPUT_SIZE, FACENET_INPUT_SIZE);
        let tensor = FaceNetEmbedder::preprocess(&face);
        let size = FACENET_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, size, size, 3]);
    }

    #[test]
    fn test_preprocess_scales_to_unit_range() {
        let face = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 51]));
        let tensor = FaceNetEmbedder::preprocess(&face);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(tensor[[0, 3, 3, 0]], 1.0);
        assert_eq!(tensor[[0, 3, 3, 1]], 0.0);
        assert!((tensor[[0, 3, 3, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_is_row_major_hwc() {
        let mut face = RgbImage::new(3, 2);
        face.put_pixel(2, 0, image::Rgb([255, 255, 255]));
        let tensor = FaceNetEmbedder::preprocess(&face);
        assert_eq!(tensor[[0, 0, 2, 0]], 1.0);
        assert_eq!(tensor[[0, 1, 2, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceNetEmbedder::load(Path::new("/nonexistent/facenet.onnx"), FACENET_EMBEDDING_OUTPUT, 160)
            .err()
            .unwrap();
        assert!(matches!(err, EmbedderError::ModelNotFound(_)));
    }
}
