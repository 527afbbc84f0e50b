use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DetectorError;

pub const DEFAULT_MODEL_PATH: &str = "models/detector.onnx";
pub const DEFAULT_CLASSES_PATH: &str = "models/classes";
pub const DEFAULT_MIN_PROB: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

pub const MODEL_PATH_ENV: &str = "NUDENET_MODEL_PATH";
pub const CLASSES_PATH_ENV: &str = "NUDENET_CLASSES_PATH";

/// Bounds for the uniform resize applied before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePolicy {
    pub min_side: u32,
    pub max_side: u32,
}

/// Detection mode, selecting the resize policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Longest side at most 320px.
    #[default]
    Fast,
    /// Shortest side 800px, longest side at most 1333px.
    #[serde(alias = "slow")]
    Accurate,
}

impl Mode {
    pub fn size_policy(self) -> SizePolicy {
        match self {
            Mode::Fast => SizePolicy {
                min_side: 320,
                max_side: 320,
            },
            Mode::Accurate => SizePolicy {
                min_side: 800,
                max_side: 1333,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Accurate => "accurate",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode {0:?}, expected \"fast\" or \"accurate\"")]
pub struct ParseModeError(String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Mode::Fast),
            "accurate" | "slow" => Ok(Mode::Accurate),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Startup configuration for a [`Detector`](crate::Detector).
///
/// Paths are only touched lazily: the class file on the first decode, the
/// model once per worker on that worker's first call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub classes_path: PathBuf,
    pub default_mode: Mode,
    pub min_prob: f32,
    pub iou_threshold: f32,
    /// Intra-op threads for each engine session.
    pub intra_threads: usize,
    pub max_input_bytes: usize,
    pub max_dimension: u32,
    pub max_alloc_bytes: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            classes_path: PathBuf::from(DEFAULT_CLASSES_PATH),
            default_mode: Mode::Fast,
            min_prob: DEFAULT_MIN_PROB,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            intra_threads: 1,
            max_input_bytes: 50 * 1024 * 1024,
            max_dimension: 15_000,
            max_alloc_bytes: 512 * 1024 * 1024,
        }
    }
}

impl DetectorConfig {
    /// Defaults, with model and class paths overridden from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(MODEL_PATH_ENV) {
            config.model_path = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os(CLASSES_PATH_ENV) {
            config.classes_path = PathBuf::from(path);
        }
        config
    }

    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| DetectorError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| DetectorError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), DetectorError> {
        let reason = if !(0.0..=1.0).contains(&self.min_prob) {
            Some(format!("min_prob {} outside [0, 1]", self.min_prob))
        } else if !(0.0..=1.0).contains(&self.iou_threshold) {
            Some(format!("iou_threshold {} outside [0, 1]", self.iou_threshold))
        } else if self.intra_threads == 0 {
            Some("intra_threads must be at least 1".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(DetectorError::ConfigLoad {
                path: path.to_path_buf(),
                reason,
            }),
            None => Ok(()),
        }
    }
}
