//! mugshot-core: face enrollment and recognition engine.
//!
//! Uses SCRFD for face location and ArcFace for embeddings, both running via
//! ONNX Runtime, plus the in-memory embedding index that recognition queries.

pub mod detector;
pub mod face;
pub mod index;
pub mod pipeline;
pub mod recognizer;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use face::FaceSelection;
pub use index::{EmbeddingIndex, Nearest, SharedIndex, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{EmbeddingExtractor, EnrollmentSample, FaceLocator, FacePipeline, PipelineError};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, Identity, IdentityId, NewIdentity, RecognitionResult};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/mugshot/models")
}
