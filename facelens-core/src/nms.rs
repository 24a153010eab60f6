//! Greedy non-maximum suppression.

use facelens_utils::OverlapMetric;

use crate::decode::Candidate;
use crate::geometry::BoundingBox;

/// Overlap of two boxes under `metric`.
pub fn overlap(a: &BoundingBox, b: &BoundingBox, metric: OverlapMetric) -> f32 {
    match metric {
        OverlapMetric::Union => a.iou(b),
        OverlapMetric::Min => a.iou_min(b),
    }
}

/// Indices of the boxes kept by greedy suppression, best score first.
///
/// Boxes are visited in descending score order (ties keep input order). A box is discarded when
/// its overlap with any already kept box is strictly greater than `threshold`. Boxes whose score
/// is not finite are never kept.
pub fn suppress_indices(
    boxes: &[BoundingBox],
    scores: &[f32],
    threshold: f32,
    metric: OverlapMetric,
    max_results: Option<usize>,
) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());
    let len = boxes.len().min(scores.len());
    let mut order: Vec<usize> = (0..len).filter(|&i| scores[i].is_finite()).collect();
    // `sort_by` is stable so equal scores stay in input order.
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let limit = max_results.unwrap_or(usize::MAX);
    let mut kept: Vec<usize> = Vec::with_capacity(len.min(limit));
    for index in order {
        if kept.len() >= limit {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|&k| overlap(&boxes[index], &boxes[k], metric) > threshold);
        if !suppressed {
            kept.push(index);
        }
    }
    kept
}

/// Apply non-maximum suppression to a list of candidates, returning the survivors best first.
pub fn non_max_suppression(
    candidates: Vec<Candidate>,
    threshold: f32,
    metric: OverlapMetric,
    max_results: Option<usize>,
) -> Vec<Candidate> {
    let boxes: Vec<BoundingBox> = candidates.iter().map(|c| c.bbox).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    suppress_indices(&boxes, &scores, threshold, metric, max_results)
        .into_iter()
        .map(|i| candidates[i])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, size: f32, score: f32) -> Candidate {
        Candidate::new(BoundingBox::new(x, y, size, size), score)
    }

    #[test]
    fn suppresses_overlapping_lower_scores() {
        let candidates = vec![
            cand(1.0, 1.0, 10.0, 0.95),
            cand(0.0, 0.0, 10.0, 0.99),
            cand(50.0, 50.0, 10.0, 0.5),
        ];
        let kept = non_max_suppression(candidates, 0.3, OverlapMetric::Union, None);
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.99, 0.5]);
    }

    #[test]
    fn threshold_one_keeps_everything() {
        let candidates = vec![
            cand(0.0, 0.0, 10.0, 0.9),
            cand(0.0, 0.0, 10.0, 0.8),
            cand(2.0, 2.0, 10.0, 0.7),
        ];
        let kept = non_max_suppression(candidates, 1.0, OverlapMetric::Union, None);
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn tiny_threshold_keeps_best_of_overlapping_group() {
        let candidates = vec![
            cand(0.0, 0.0, 10.0, 0.6),
            cand(8.0, 0.0, 10.0, 0.9),
            cand(16.0, 0.0, 10.0, 0.7),
            cand(100.0, 100.0, 10.0, 0.1),
        ];
        let kept = non_max_suppression(candidates, 1e-6, OverlapMetric::Union, None);
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        // 0.9 overlaps both neighbours; the far box never overlaps anything.
        assert_eq!(scores, vec![0.9, 0.1]);
    }

    #[test]
    fn output_is_subset_without_pairs_above_threshold() {
        let candidates: Vec<Candidate> = (0..20)
            .map(|i| cand((i * 3) as f32, ((i * 7) % 11) as f32, 12.0, 1.0 - i as f32 * 0.03))
            .collect();
        let kept = non_max_suppression(candidates.clone(), 0.4, OverlapMetric::Union, None);
        for k in &kept {
            assert!(candidates.contains(k));
        }
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(a.bbox.iou(&b.bbox) <= 0.4);
            }
        }
    }

    #[test]
    fn equal_scores_keep_input_order() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(1.0, 1.0, 10.0, 10.0),
        ];
        let kept = suppress_indices(&boxes, &[0.5, 0.5], 0.3, OverlapMetric::Union, None);
        assert_eq!(kept, vec![0]);
    }

    #[test]
    fn non_finite_scores_are_skipped() {
        let boxes: Vec<BoundingBox> = (0..5)
            .map(|i| BoundingBox::new(i as f32 * 100.0, 0.0, 10.0, 10.0))
            .collect();
        let scores = [0.9, f32::NAN, 0.8, f32::INFINITY, f32::NAN];
        let kept = suppress_indices(&boxes, &scores, 0.5, OverlapMetric::Union, None);
        assert_eq!(kept, vec![0, 2]);

        let all_nan = suppress_indices(&boxes, &[f32::NAN; 5], 0.5, OverlapMetric::Union, None);
        assert!(all_nan.is_empty());
    }

    #[test]
    fn min_metric_removes_nested_boxes() {
        let candidates = vec![cand(0.0, 0.0, 40.0, 0.9), cand(5.0, 5.0, 10.0, 0.8)];
        let union = non_max_suppression(candidates.clone(), 0.5, OverlapMetric::Union, None);
        let min = non_max_suppression(candidates, 0.5, OverlapMetric::Min, None);
        assert_eq!(union.len(), 2);
        assert_eq!(min.len(), 1);
    }

    #[test]
    fn max_results_caps_output() {
        let candidates: Vec<Candidate> = (0..5)
            .map(|i| cand(i as f32 * 100.0, 0.0, 10.0, 0.5 + i as f32 * 0.1))
            .collect();
        let kept = non_max_suppression(candidates, 0.5, OverlapMetric::Union, Some(2));
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
    }
}
