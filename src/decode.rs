use ndarray::{ArrayView1, ArrayView3, Axis};
use tracing::{debug, warn};

use crate::detection::{Detection, DetectionLabel};
use crate::error::DetectorError;

/// Number of leading box features per anchor: center x, center y, width, height.
pub const BOX_FEATURES: usize = 4;

/// Decodes a `[1, 4 + C, N]` output tensor into pre-NMS detections.
///
/// Anchors whose best class score is below `min_prob` are dropped. Boxes are
/// mapped back to original image pixels by dividing by `scale`.
///
/// # Errors
///
/// `InvalidOutputShape` if the batch is not 1 or there are no score channels,
/// `ClassCountMismatch` if `C` differs from the number of classes.
pub fn decode(
    output: ArrayView3<'_, f32>,
    classes: &[DetectionLabel],
    scale: f64,
    min_prob: f32,
) -> Result<Vec<Detection>, DetectorError> {
    let (batch, features, anchors) = output.dim();
    if batch != 1 || features <= BOX_FEATURES {
        return Err(DetectorError::InvalidOutputShape {
            expected: "[1, 4 + classes, anchors]".into(),
            got: format!("{:?}", output.shape()),
        });
    }

    let model_classes = features - BOX_FEATURES;
    if model_classes != classes.len() {
        return Err(DetectorError::ClassCountMismatch {
            classes: classes.len(),
            model_classes,
        });
    }

    if !(scale.is_finite() && scale > 0.0) {
        return Err(DetectorError::Processing(format!("invalid scale factor {scale}")));
    }

    // [features, anchors] viewed anchor-major without copying
    let per_anchor = output.index_axis(Axis(0), 0).reversed_axes();

    let mut detections = Vec::new();
    let mut non_finite = 0usize;

    for row in per_anchor.outer_iter() {
        let Some((class_idx, score)) = best_class(row.slice(ndarray::s![BOX_FEATURES..])) else {
            continue;
        };
        if score < min_prob {
            continue;
        }

        let Some(&label) = classes.get(class_idx) else {
            warn!(class_idx, "class index outside class list, anchor dropped");
            continue;
        };

        let center_box = [row[0], row[1], row[2], row[3]];
        if center_box.iter().any(|v| !v.is_finite()) {
            non_finite += 1;
            continue;
        }

        detections.push(Detection::new(to_original_box(center_box, scale), score, label));
    }

    if non_finite > 0 {
        warn!(non_finite, "anchors with non-finite boxes dropped");
    }
    debug!(anchors, candidates = detections.len(), min_prob, "decoded model output");

    Ok(detections)
}

/// Highest score and its channel. Ties keep the lowest channel; NaN scores never win.
fn best_class(scores: ArrayView1<'_, f32>) -> Option<(usize, f32)> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best, (idx, &score)| match best {
            _ if score.is_nan() => best,
            Some((_, best_score)) if score <= best_score => best,
            _ => Some((idx, score)),
        })
}

/// Converts a center-format box in resized pixels to a rounded corner box in
/// original pixels. Coordinates beyond the `i32` range saturate.
pub fn to_original_box(center_box: [f32; 4], scale: f64) -> [i32; 4] {
    let [xc, yc, w, h] = center_box.map(f64::from);
    [
        ((xc - w / 2.0) / scale).round() as i32,
        ((yc - h / 2.0) / scale).round() as i32,
        ((xc + w / 2.0) / scale).round() as i32,
        ((yc + h / 2.0) / scale).round() as i32,
    ]
}
