//! Boundary to the neural-network runtime.
//!
//! The pipeline only needs two things from an engine: the name of its single
//! input and a forward pass from a `[1, 3, H, W]` tensor to a rank-3 output.

use std::sync::Arc;

use ndarray::{Array3, ArrayView4};

use crate::config::DetectorConfig;
use crate::error::DetectorError;

/// A loaded model able to run forward passes.
///
/// Engines are owned by exactly one worker, so `run` takes `&mut self`.
pub trait InferenceEngine: Send + 'static {
    /// Name of the model's declared input tensor.
    fn input_name(&self) -> &str;

    /// Runs one forward pass and returns the first output as `[batch, features, anchors]`.
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, DetectorError>;
}

/// Builds a fresh engine for a worker.
pub type EngineFactory<E> = Arc<dyn Fn(&DetectorConfig) -> Result<E, DetectorError> + Send + Sync>;

/// Upper bound on anchors accepted from a model, checked before the output is copied.
pub const MAX_OUTPUT_ANCHORS: usize = 50_000;

/// Checks that a raw output shape is `[1, features, anchors]` and converts it.
pub(crate) fn output_dims(shape: &[i64]) -> Result<(usize, usize, usize), DetectorError> {
    let invalid = || DetectorError::InvalidOutputShape {
        expected: "[1, 4 + classes, anchors]".into(),
        got: format!("{shape:?}"),
    };

    let [batch, features, anchors] = *shape else {
        return Err(invalid());
    };
    if batch != 1 || features <= 4 || anchors < 0 {
        return Err(invalid());
    }

    let (features, anchors) = (features as usize, anchors as usize);
    if anchors > MAX_OUTPUT_ANCHORS {
        return Err(DetectorError::InvalidOutputShape {
            expected: format!("at most {MAX_OUTPUT_ANCHORS} anchors"),
            got: format!("{anchors} anchors"),
        });
    }

    Ok((1, features, anchors))
}

#[cfg(feature = "onnx")]
pub use self::onnx::OrtEngine;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use ndarray::{Array3, ArrayView4};
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::TensorRef;
    use tracing::{debug, info, instrument};

    use super::{output_dims, InferenceEngine};
    use crate::error::DetectorError;

    /// ONNX Runtime session on the CPU execution provider.
    pub struct OrtEngine {
        session: Session,
        input_name: String,
        output_name: String,
    }

    impl OrtEngine {
        /// Loads the model and caches its input and output names.
        ///
        /// # Errors
        ///
        /// `ModelLoad` if the file is missing, cannot be parsed, or declares no input.
        #[instrument]
        pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
            let load_err = |reason: String| DetectorError::ModelLoad {
                path: model_path.to_path_buf(),
                reason,
            };

            if !model_path.is_file() {
                return Err(load_err("model file not found".into()));
            }

            info!(path = %model_path.display(), "loading detector model");

            let session = Session::builder()
                .map_err(|e| load_err(e.to_string()))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| load_err(e.to_string()))?
                .with_intra_threads(intra_threads)
                .map_err(|e| load_err(e.to_string()))?
                .commit_from_file(model_path)
                .map_err(|e| load_err(e.to_string()))?;

            let input_name = session
                .inputs()
                .first()
                .map(|input| input.name().to_string())
                .ok_or_else(|| load_err("model has no inputs".into()))?;

            let output_name = session
                .outputs()
                .first()
                .map(|output| output.name().to_string())
                .ok_or_else(|| load_err("model has no outputs".into()))?;

            debug!(input_name = %input_name, output_name = %output_name, "model loaded successfully");

            Ok(Self {
                session,
                input_name,
                output_name,
            })
        }
    }

    impl InferenceEngine for OrtEngine {
        fn input_name(&self) -> &str {
            &self.input_name
        }

        fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, DetectorError> {
            let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
            let data = input.as_slice().ok_or_else(|| {
                DetectorError::Processing("input tensor is not contiguous in memory".into())
            })?;

            let tensor = TensorRef::from_array_view((dims, data))?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => tensor])?;

            let (shape, values) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
            let shape: Vec<i64> = shape.iter().copied().collect();
            let dims = output_dims(&shape)?;
            let expected_len = dims.1.saturating_mul(dims.2);
            if values.len() != expected_len {
                return Err(DetectorError::InvalidOutputShape {
                    expected: format!("{expected_len} elements"),
                    got: format!("{} elements", values.len()),
                });
            }

            Array3::from_shape_vec(dims, values.to_vec()).map_err(|e| {
                DetectorError::InvalidOutputShape {
                    expected: format!("{dims:?}"),
                    got: e.to_string(),
                }
            })
        }
    }
}
