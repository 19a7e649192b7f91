//! rollcall-models: Pretrained model adapters.
//!
//! SCRFD for face detection and FaceNet for embeddings, both running via
//! ONNX Runtime on the CPU behind the `rollcall-core` capability traits.

pub mod detector;
pub mod embedder;

pub use detector::{DetectorError, ScrfdDetector, SCRFD_DEFAULT_CONFIDENCE};
pub use embedder::{EmbedderError, FaceNetEmbedder, FACENET_EMBEDDING_OUTPUT, FACENET_INPUT_SIZE};
