//! Nudity detection on still images with a YOLOv8-style ONNX detector.
//!
//! The pipeline resizes an image under a mode-selected size policy, runs one
//! forward pass, decodes the `[1, 4 + C, N]` output into labeled boxes and
//! applies class-aware non-maximum suppression. Boxes come back in the
//! original image's pixel coordinates.
//!
//! ```no_run
//! use nudenet::{detect_from_path, Mode};
//!
//! for detection in detect_from_path("photo.jpg", Mode::Fast, None)? {
//!     println!("{detection}");
//! }
//! # Ok::<(), nudenet::DetectorError>(())
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod classes;
pub mod config;
pub mod decode;
pub mod detection;
pub mod engine;
pub mod error;
pub mod image_processing;
pub mod nms;
pub mod session_cache;
pub mod vision;

pub use classes::ClassRegistry;
pub use config::{DetectorConfig, Mode, SizePolicy};
pub use detection::{Detection, DetectionLabel};
pub use engine::{EngineFactory, InferenceEngine};
pub use error::DetectorError;
pub use session_cache::{SessionCache, SessionHandle, WorkerId};
pub use vision::{DetectionReport, Detector, ImageSource};

#[cfg(feature = "onnx")]
pub use engine::OrtEngine;

#[cfg(feature = "onnx")]
mod default_detector {
    use std::path::Path;
    use std::sync::LazyLock;

    use crate::config::{DetectorConfig, Mode};
    use crate::detection::Detection;
    use crate::engine::OrtEngine;
    use crate::error::DetectorError;
    use crate::vision::Detector;

    static DEFAULT_DETECTOR: LazyLock<Detector<OrtEngine>> =
        LazyLock::new(|| Detector::new(DetectorConfig::from_env()));

    /// Process-wide detector configured from the environment.
    ///
    /// Model sessions and the class list load lazily on first detection, so
    /// touching this is cheap.
    pub fn default_detector() -> &'static Detector<OrtEngine> {
        &DEFAULT_DETECTOR
    }

    /// Detects on an image file using the process-wide detector.
    ///
    /// `min_prob` defaults to 0.25 when `None`.
    pub fn detect_from_path(
        path: impl AsRef<Path>,
        mode: Mode,
        min_prob: Option<f32>,
    ) -> Result<Vec<Detection>, DetectorError> {
        DEFAULT_DETECTOR.detect_from_path(path, mode, min_prob)
    }

    /// Detects on encoded image bytes using the process-wide detector.
    pub fn detect_from_bytes(
        bytes: &[u8],
        mode: Mode,
        min_prob: Option<f32>,
    ) -> Result<Vec<Detection>, DetectorError> {
        DEFAULT_DETECTOR.detect_from_bytes(bytes, mode, min_prob)
    }
}

#[cfg(feature = "onnx")]
pub use default_detector::{default_detector, detect_from_bytes, detect_from_path};
