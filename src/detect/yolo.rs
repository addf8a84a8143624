//! Decoding for anchor-free `[batch, 4 + C, N]` detection heads.
//!
//! Each of the N candidates carries `[cx, cy, w, h]` in model input pixels
//! followed by one score per class. Candidates are scored by their best
//! class, thresholded, converted to corners and passed through class-wise
//! greedy non-maximum suppression.

use super::decode::DecodeError;
use super::result::{BoxEncoding, DetectionResult};
use super::tensor::TensorData;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct YoloDecodeOptions {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: Option<usize>,
}

impl Default for YoloDecodeOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: Some(300),
        }
    }
}

/// Decode one `[batch, 4 + C, N]` output into pixel-corner detections per image.
pub fn decode_yolo_head(output: &TensorData, options: YoloDecodeOptions) -> Result<Vec<DetectionResult>, DecodeError> {
    if output.rank() != 3 {
        return Err(DecodeError::Rank {
            scale: 0,
            grid: "yolo",
            expected: 3,
            actual: output.rank(),
        });
    }

    let (batch, channels, candidates) = (output.shape()[0], output.shape()[1], output.shape()[2]);
    if channels < 5 {
        return Err(DecodeError::ChannelCount {
            scale: 0,
            grid: "yolo",
            expected: 5,
            actual: channels,
        });
    }
    let classes = channels - 4;

    let mut results = Vec::with_capacity(batch);
    for image in 0..batch {
        let at = |channel: usize, candidate: usize| output.data()[output.offset(&[image, channel, candidate])];

        let mut kept = DetectionResult::empty(BoxEncoding::CornersPixels);
        for candidate in 0..candidates {
            let (label, score) = (0..classes)
                .map(|class| (class, at(4 + class, candidate)))
                .fold((0, f32::NEG_INFINITY), |best, next| if next.1 > best.1 { next } else { best });

            if score < options.confidence_threshold {
                continue;
            }

            let (cx, cy, w, h) = (at(0, candidate), at(1, candidate), at(2, candidate), at(3, candidate));
            kept.push([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0], score, label);
        }

        results.push(non_max_suppression(kept, options.iou_threshold, options.max_detections));
    }

    Ok(results)
}

/// Greedy class-wise NMS. Output is ordered by descending score.
pub fn non_max_suppression(candidates: DetectionResult, iou_threshold: f32, max: Option<usize>) -> DetectionResult {
    let scores = candidates.scores();
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep: Vec<usize> = Vec::new();
    for index in order {
        if max.is_some_and(|max| keep.len() >= max) {
            break;
        }
        let label = candidates.labels()[index];
        let bbox = candidates.boxes()[index];
        let suppressed = keep
            .iter()
            .any(|&k| candidates.labels()[k] == label && iou(candidates.boxes()[k], bbox) > iou_threshold);
        if !suppressed {
            keep.push(index);
        }
    }

    candidates.select(&keep)
}

/// Intersection over union of two corner boxes.
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area = |r: [f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a `[1, 4 + C, N]` tensor from per-candidate rows.
    fn head(rows: &[Vec<f32>]) -> TensorData {
        let channels = rows[0].len();
        let mut data = vec![0.0; channels * rows.len()];
        for (candidate, row) in rows.iter().enumerate() {
            for (channel, value) in row.iter().enumerate() {
                data[channel * rows.len() + candidate] = *value;
            }
        }
        TensorData::new(vec![1, channels, rows.len()], data).unwrap()
    }

    #[test]
    fn overlapping_boxes_of_same_class_are_suppressed() {
        let output = head(&[
            vec![50.0, 50.0, 20.0, 20.0, 0.9, 0.0],
            vec![51.0, 50.0, 20.0, 20.0, 0.8, 0.0],
            vec![50.0, 50.0, 20.0, 20.0, 0.0, 0.7],
            vec![10.0, 10.0, 4.0, 4.0, 0.1, 0.0],
        ]);

        let results = decode_yolo_head(&output, YoloDecodeOptions::default()).unwrap();
        let result = &results[0];

        assert_eq!(result.scores(), &[0.9, 0.7]);
        assert_eq!(result.labels(), &[0, 1]);
        assert_eq!(result.boxes()[0], [40.0, 40.0, 60.0, 60.0]);
        assert_eq!(result.encoding(), BoxEncoding::CornersPixels);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou([0.0, 0.0, 1.0, 1.0], [2.0, 2.0, 3.0, 3.0]), 0.0);
        assert!((iou([0.0, 0.0, 2.0, 2.0], [1.0, 0.0, 3.0, 2.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_heads_without_classes() {
        let output = TensorData::filled(vec![1, 4, 3], 0.0);
        assert!(matches!(
            decode_yolo_head(&output, YoloDecodeOptions::default()),
            Err(DecodeError::ChannelCount { .. })
        ));
    }
}
