use tracing::debug;

use crate::detection::Detection;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
///
/// Returns 0 when the union is empty. Areas are computed in `f64`, so boxes
/// spanning the whole `i32` range cannot overflow.
pub fn iou(a: [i32; 4], b: [i32; 4]) -> f32 {
    let [a_x1, a_y1, a_x2, a_y2] = a.map(f64::from);
    let [b_x1, b_y1, b_x2, b_y2] = b.map(f64::from);

    let inter_w = (a_x2.min(b_x2) - a_x1.max(b_x1)).max(0.0);
    let inter_h = (a_y2.min(b_y2) - a_y1.max(b_y1)).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a_x2 - a_x1) * (a_y2 - a_y1);
    let area_b = (b_x2 - b_x1) * (b_y2 - b_y1);
    let union_area = area_a + area_b - inter_area;

    if union_area <= 0.0 {
        return 0.0;
    }

    (inter_area / union_area) as f32
}

/// Class-aware greedy non-maximum suppression.
///
/// Candidates are visited by descending score; equal scores keep their input
/// order. Each kept box removes every remaining box with the same label whose
/// IoU with it is strictly greater than `iou_threshold`. The result is in
/// selection order.
pub fn suppress(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if candidates.is_empty() {
        return candidates;
    }

    let total = candidates.len();
    // Stable sort: ties stay in decode order
    candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));

    let mut suppressed = vec![false; total];

    for i in 0..total {
        if suppressed[i] {
            continue;
        }

        let best = &candidates[i];
        for j in (i + 1)..total {
            if suppressed[j] {
                continue;
            }
            let other = &candidates[j];
            if other.label() == best.label() && iou(best.bbox(), other.bbox()) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    // Survivors are exactly the selected boxes, already in selection order
    let kept: Vec<Detection> = candidates
        .into_iter()
        .zip(suppressed)
        .filter_map(|(det, dropped)| (!dropped).then_some(det))
        .collect();

    debug!(candidates = total, kept = kept.len(), iou_threshold, "nms finished");

    kept
}
