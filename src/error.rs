use std::path::PathBuf;

/// Errors surfaced by the detection pipeline.
///
/// A call either succeeds with a (possibly empty) detection list or fails with
/// exactly one of these. Nothing is retried internally.
#[derive(thiserror::Error, Debug)]
pub enum DetectorError {
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidImage { width: u32, height: u32 },

    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("failed to load configuration {path}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    #[error("class list has {classes} entries but model scores {model_classes} classes")]
    ClassCountMismatch { classes: usize, model_classes: usize },

    #[error("invalid model output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    #[error("inference engine error: {0}")]
    Inference(String),

    /// Internal fault outside the forward pass, e.g. a poisoned lock.
    #[error("processing error: {0}")]
    Processing(String),
}

impl DetectorError {
    /// True for configuration problems that will fail every call until the
    /// model or class file is fixed.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            DetectorError::ModelLoad { .. }
                | DetectorError::ConfigLoad { .. }
                | DetectorError::ClassCountMismatch { .. }
        )
    }
}

impl From<image::ImageError> for DetectorError {
    fn from(e: image::ImageError) -> Self {
        DetectorError::Decode(e)
    }
}

// Forward-pass failures only; session construction maps to `ModelLoad` explicitly.
#[cfg(feature = "onnx")]
impl From<ort::Error> for DetectorError {
    fn from(e: ort::Error) -> Self {
        // Log full error internally, return sanitized version externally
        tracing::error!(error = %e, "ORT inference error");
        DetectorError::Inference("internal inference error".into())
    }
}
