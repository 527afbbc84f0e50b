use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use ndarray::Axis;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::classes::ClassRegistry;
use crate::config::{DetectorConfig, Mode};
use crate::decode::decode;
use crate::detection::Detection;
use crate::engine::{EngineFactory, InferenceEngine};
use crate::error::DetectorError;
use crate::image_processing::{decode_bytes, decode_path, preprocess};
use crate::nms::suppress;
use crate::session_cache::{SessionCache, WorkerId};

// ============================================================================
// Inputs and results
// ============================================================================

/// Where the image for one detection call comes from.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
    Image(&'a DynamicImage),
}

impl<'a> From<&'a Path> for ImageSource<'a> {
    fn from(path: &'a Path) -> Self {
        ImageSource::Path(path)
    }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl<'a> From<&'a DynamicImage> for ImageSource<'a> {
    fn from(image: &'a DynamicImage) -> Self {
        ImageSource::Image(image)
    }
}

/// Detections plus per-stage metadata for one call.
#[derive(Debug, Clone, Serialize)]
#[must_use]
pub struct DetectionReport {
    pub detections: Vec<Detection>,
    /// Number of candidates that cleared `min_prob`, before NMS
    pub candidates_before_nms: usize,
    /// Factor applied to the original image before inference
    pub scale: f64,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

// ============================================================================
// Detector
// ============================================================================

/// Runs the full pipeline: preprocess, infer, decode, suppress.
///
/// # Thread Safety
///
/// `Detector` is shared freely between threads. Each worker gets its own
/// engine session on first use and keeps it; no lock is held across a
/// forward pass that another worker could be waiting on. The class list is
/// loaded once per class file for the whole process.
pub struct Detector<E> {
    config: Arc<DetectorConfig>,
    sessions: SessionCache<E>,
    classes: Arc<ClassRegistry>,
}

#[cfg(feature = "onnx")]
impl Detector<crate::engine::OrtEngine> {
    /// Detector backed by ONNX Runtime. Nothing is loaded until the first call.
    pub fn new(config: DetectorConfig) -> Self {
        let factory: EngineFactory<crate::engine::OrtEngine> = Arc::new(|config: &DetectorConfig| {
            crate::engine::OrtEngine::load(&config.model_path, config.intra_threads)
        });
        Self::with_engine_factory(config, factory)
    }
}

impl<E: InferenceEngine> Detector<E> {
    pub fn with_engine_factory(config: DetectorConfig, factory: EngineFactory<E>) -> Self {
        let classes = ClassRegistry::shared(config.classes_path.clone());
        let config = Arc::new(config);
        Self {
            sessions: SessionCache::new(Arc::clone(&config), factory),
            config,
            classes,
        }
    }

    /// Replaces the process-wide registry, e.g. with a preloaded one.
    pub fn with_class_registry(mut self, classes: Arc<ClassRegistry>) -> Self {
        self.classes = classes;
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn class_registry(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn sessions(&self) -> &SessionCache<E> {
        &self.sessions
    }

    pub fn detect_from_path(
        &self,
        path: impl AsRef<Path>,
        mode: Mode,
        min_prob: Option<f32>,
    ) -> Result<Vec<Detection>, DetectorError> {
        self.detect(ImageSource::Path(path.as_ref()), Some(mode), min_prob)
    }

    pub fn detect_from_bytes(
        &self,
        bytes: &[u8],
        mode: Mode,
        min_prob: Option<f32>,
    ) -> Result<Vec<Detection>, DetectorError> {
        self.detect(ImageSource::Bytes(bytes), Some(mode), min_prob)
    }

    /// Detects on the calling thread's session.
    ///
    /// `mode` falls back to the configured default mode and `min_prob` to the
    /// configured threshold (0.25 unless overridden).
    pub fn detect(
        &self,
        source: ImageSource<'_>,
        mode: Option<Mode>,
        min_prob: Option<f32>,
    ) -> Result<Vec<Detection>, DetectorError> {
        self.detect_with_report(WorkerId::current(), source, mode, min_prob)
            .map(|report| report.detections)
    }

    /// Runs one detection on `worker`'s session and reports stage timings.
    ///
    /// # Errors
    ///
    /// The first failing stage's error; no partial results are returned.
    #[instrument(skip(self, source))]
    pub fn detect_with_report(
        &self,
        worker: WorkerId,
        source: ImageSource<'_>,
        mode: Option<Mode>,
        min_prob: Option<f32>,
    ) -> Result<DetectionReport, DetectorError> {
        let mode = mode.unwrap_or(self.config.default_mode);
        let min_prob = min_prob.unwrap_or(self.config.min_prob);

        // Preprocessing
        let preprocess_start = Instant::now();
        let (tensor, scale) = match source {
            ImageSource::Path(path) => preprocess(&decode_path(&self.config, path)?, mode)?,
            ImageSource::Bytes(bytes) => preprocess(&decode_bytes(&self.config, bytes)?, mode)?,
            ImageSource::Image(image) => preprocess(image, mode)?,
        };
        let preprocess_ms = preprocess_start.elapsed().as_secs_f64() * 1000.0;

        // Inference
        let inference_start = Instant::now();
        let session = self.sessions.get_session(worker)?;
        let batched = tensor.view().insert_axis(Axis(0));
        let output = session.with(|engine| engine.run(batched))??;
        let inference_ms = inference_start.elapsed().as_secs_f64() * 1000.0;

        // Decoding and suppression
        let postprocess_start = Instant::now();
        let classes = self.classes.classes()?;
        let candidates = decode(output.view(), classes, scale, min_prob)?;
        let candidates_before_nms = candidates.len();
        let detections = suppress(candidates, self.config.iou_threshold);
        let postprocess_ms = postprocess_start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            detections = detections.len(),
            candidates_before_nms,
            scale,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
            "Detection completed"
        );

        Ok(DetectionReport {
            detections,
            candidates_before_nms,
            scale,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionLabel;
    use image::{Rgb, RgbImage};
    use ndarray::{Array3, ArrayView4};
    use std::sync::Mutex;

    /// Engine replaying a fixed output and recording the input shapes it saw.
    struct ScriptedEngine {
        output: Array3<f32>,
        seen: Arc<Mutex<Vec<Vec<usize>>>>,
    }

    impl InferenceEngine for ScriptedEngine {
        fn input_name(&self) -> &str {
            "images"
        }

        fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, DetectorError> {
            self.seen.lock().unwrap().push(input.shape().to_vec());
            Ok(self.output.clone())
        }
    }

    /// `[1, 22, N]` output with the given (center box, class, score) anchors.
    fn scripted_output(anchors: &[([f32; 4], usize, f32)]) -> Array3<f32> {
        let mut output = Array3::<f32>::zeros((1, 22, anchors.len()));
        for (i, (center_box, class_idx, score)) in anchors.iter().enumerate() {
            for (f, v) in center_box.iter().enumerate() {
                output[[0, f, i]] = *v;
            }
            output[[0, 4 + class_idx, i]] = *score;
        }
        output
    }

    fn detector(output: Array3<f32>) -> (Detector<ScriptedEngine>, Arc<Mutex<Vec<Vec<usize>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_factory = Arc::clone(&seen);
        let factory: EngineFactory<ScriptedEngine> = Arc::new(move |_config: &DetectorConfig| {
            Ok(ScriptedEngine {
                output: output.clone(),
                seen: Arc::clone(&seen_by_factory),
            })
        });
        let detector = Detector::with_engine_factory(DetectorConfig::default(), factory)
            .with_class_registry(Arc::new(ClassRegistry::from_labels(DetectionLabel::ALL.to_vec())));
        (detector, seen)
    }

    fn image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([128, 64, 32])))
    }

    #[test]
    fn pipeline_descales_and_suppresses() {
        // 1000x500 in fast mode is resized by 0.32
        let output = scripted_output(&[
            ([160.0, 80.0, 64.0, 32.0], 2, 0.9),
            ([161.0, 80.0, 64.0, 32.0], 2, 0.6),
            ([160.0, 80.0, 64.0, 32.0], 5, 0.5),
            ([20.0, 20.0, 10.0, 10.0], 0, 0.1),
        ]);
        let (detector, seen) = detector(output);
        let img = image(1000, 500);

        let report = detector
            .detect_with_report(WorkerId::current(), ImageSource::Image(&img), Some(Mode::Fast), None)
            .unwrap();

        assert_eq!(seen.lock().unwrap()[0], vec![1, 3, 160, 320]);
        assert!((report.scale - 0.32).abs() < 1e-12);
        assert_eq!(report.candidates_before_nms, 3);
        assert_eq!(report.detections.len(), 2);

        let first = &report.detections[0];
        assert_eq!(first.label(), DetectionLabel::FemaleBreastExposed);
        assert_eq!(first.bbox(), [400, 200, 600, 300]);
        assert_eq!(report.detections[1].label(), DetectionLabel::MaleBreastExposed);
    }

    #[test]
    fn min_prob_override_filters_candidates() {
        let output = scripted_output(&[([50.0, 50.0, 10.0, 10.0], 1, 0.6)]);
        let (detector, _) = detector(output);
        let img = image(320, 320);

        assert_eq!(detector.detect(ImageSource::Image(&img), None, None).unwrap().len(), 1);
        assert!(detector
            .detect(ImageSource::Image(&img), None, Some(0.7))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn accurate_mode_feeds_larger_tensor() {
        let (detector, seen) = detector(scripted_output(&[]));
        let img = image(400, 300);

        let detections = detector
            .detect(ImageSource::Image(&img), Some(Mode::Accurate), None)
            .unwrap();

        assert!(detections.is_empty());
        // 800 / 300 scales the long side to 1067, below 1333
        assert_eq!(seen.lock().unwrap()[0], vec![1, 3, 800, 1067]);
    }

    #[test]
    fn bad_bytes_fail_before_loading_a_session() {
        let (detector, _) = detector(scripted_output(&[]));
        let err = detector
            .detect_from_bytes(b"definitely not an image", Mode::Fast, None)
            .unwrap_err();

        assert!(matches!(err, DetectorError::Decode(_)));
        assert!(detector.sessions().is_empty());
    }

    #[test]
    fn mismatched_class_list_is_fatal() {
        let (detector, _) = detector(scripted_output(&[([50.0, 50.0, 10.0, 10.0], 1, 0.6)]));
        let detector = detector.with_class_registry(Arc::new(ClassRegistry::from_labels(vec![
            DetectionLabel::FaceFemale,
            DetectionLabel::FaceMale,
        ])));
        let img = image(64, 64);

        let err = detector.detect(ImageSource::Image(&img), None, None).unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[test]
    fn missing_class_file_is_config_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory: EngineFactory<ScriptedEngine> = Arc::new(move |_config: &DetectorConfig| {
            Ok(ScriptedEngine {
                output: scripted_output(&[]),
                seen: Arc::clone(&seen),
            })
        });
        let config = DetectorConfig {
            classes_path: "/nonexistent/classes".into(),
            ..Default::default()
        };
        let detector = Detector::with_engine_factory(config, factory);
        let img = image(64, 64);

        let err = detector.detect(ImageSource::Image(&img), None, None).unwrap_err();
        assert!(matches!(err, DetectorError::ConfigLoad { .. }));
    }

    #[test]
    fn engine_failure_propagates() {
        struct FailingEngine;

        impl InferenceEngine for FailingEngine {
            fn input_name(&self) -> &str {
                "images"
            }

            fn run(&mut self, _input: ArrayView4<'_, f32>) -> Result<Array3<f32>, DetectorError> {
                Err(DetectorError::Inference("forward pass failed".into()))
            }
        }

        let factory: EngineFactory<FailingEngine> = Arc::new(|_config: &DetectorConfig| Ok(FailingEngine));
        let detector = Detector::with_engine_factory(DetectorConfig::default(), factory);
        let img = image(32, 32);

        let err = detector.detect(ImageSource::Image(&img), None, None).unwrap_err();
        assert!(matches!(err, DetectorError::Inference(_)));
        // Class file is never touched when inference fails
        assert!(!detector.class_registry().is_loaded());
    }
}
