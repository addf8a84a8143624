//! Anchor-head detection decoding.
//!
//! Turns the raw multi-scale output of an anchor-based detection head into a
//! flat list of detections per image:
//!
//! 1. in every grid cell, keep only the anchor with the highest objectness;
//! 2. drop the cell when that objectness is below the confidence threshold;
//! 3. decode the box center as `(sigmoid(raw) + cell) / grid` and its size as
//!    `exp(raw) * anchor`;
//! 4. label with the argmax of the class logits, score with the objectness;
//! 5. concatenate scales in order and optionally keep the top K by score.
//!
//! Overlapping boxes from neighbouring cells or other scales are not
//! suppressed.

use thiserror::Error;

use super::result::{BoxEncoding, DetectionResult};
use super::tensor::TensorData;

/// Structural mismatch between head outputs and the decoder configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("expected {expected} detection scales, received {actual}")]
    ScaleCount { expected: usize, actual: usize },

    #[error("scale {scale}: expected {expected} anchors, received {actual}")]
    AnchorCount {
        scale: usize,
        expected: usize,
        actual: usize,
    },

    #[error("scale {scale}: {grid} grid has {actual} channels, expected {expected}")]
    ChannelCount {
        scale: usize,
        grid: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("scale {scale}: {grid} grid has rank {actual}, expected {expected}")]
    Rank {
        scale: usize,
        grid: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("scale {scale}: {grid} grid shape {actual:?} disagrees with box grid {expected:?}")]
    GridMismatch {
        scale: usize,
        grid: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("scale {scale}: batch size {actual} differs from first scale ({expected})")]
    BatchMismatch {
        scale: usize,
        expected: usize,
        actual: usize,
    },

    #[error("scale {scale}: class logits must have at least one channel")]
    NoClasses { scale: usize },

    #[error("tensor buffer has {actual} elements, shape requires {expected}")]
    BufferLength { expected: usize, actual: usize },

    #[error("tensor shape {0:?} overflows")]
    ShapeOverflow(Vec<usize>),

    #[error("invalid anchor set: {0}")]
    InvalidAnchors(String),
}

// ----------------------------------------------------------------------------
// Inputs
// ----------------------------------------------------------------------------

/// Anchor priors `(width, height)` per scale. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorSet {
    scales: Vec<Vec<(f32, f32)>>,
}

impl AnchorSet {
    /// Every scale must carry the same, non-zero number of finite anchors.
    pub fn new(scales: Vec<Vec<(f32, f32)>>) -> Result<Self, DecodeError> {
        let per_scale = match scales.first() {
            Some(first) if !first.is_empty() => first.len(),
            Some(_) => return Err(DecodeError::InvalidAnchors("scale 0 has no anchors".into())),
            None => return Err(DecodeError::InvalidAnchors("no scales".into())),
        };

        for (index, anchors) in scales.iter().enumerate() {
            if anchors.len() != per_scale {
                return Err(DecodeError::InvalidAnchors(format!(
                    "scale {} has {} anchors, scale 0 has {}",
                    index,
                    anchors.len(),
                    per_scale
                )));
            }
            if anchors.iter().any(|(w, h)| !w.is_finite() || !h.is_finite()) {
                return Err(DecodeError::InvalidAnchors(format!(
                    "scale {} has a non-finite anchor",
                    index
                )));
            }
        }

        Ok(Self { scales })
    }

    /// One scale with a single anchor.
    pub fn single(width: f32, height: f32) -> Self {
        Self {
            scales: vec![vec![(width, height)]],
        }
    }

    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }

    pub fn anchors_per_scale(&self) -> usize {
        self.scales[0].len()
    }

    pub fn anchor(&self, scale: usize, index: usize) -> (f32, f32) {
        self.scales[scale][index]
    }
}

/// One scale of head output: `[batch, height, width, anchors, channels]` grids.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleTensors {
    pub box_deltas: TensorData,
    pub objectness: TensorData,
    pub class_logits: TensorData,
}

impl ScaleTensors {
    /// Split a fused `[batch, height, width, anchors, 5 + C]` head output into
    /// box deltas (channels 0..4), objectness (channel 4) and class logits.
    pub fn from_fused(head: &TensorData, scale: usize) -> Result<Self, DecodeError> {
        if head.rank() != 5 {
            return Err(DecodeError::Rank {
                scale,
                grid: "fused",
                expected: 5,
                actual: head.rank(),
            });
        }

        let channels = head.shape()[4];
        if channels < 6 {
            return Err(DecodeError::ChannelCount {
                scale,
                grid: "fused",
                expected: 6,
                actual: channels,
            });
        }

        let classes = channels - 5;
        let cells: usize = head.shape()[..4].iter().product();
        let mut box_deltas = Vec::with_capacity(cells * 4);
        let mut objectness = Vec::with_capacity(cells);
        let mut class_logits = Vec::with_capacity(cells * classes);
        for lane in head.data().chunks_exact(channels) {
            box_deltas.extend_from_slice(&lane[..4]);
            objectness.push(lane[4]);
            class_logits.extend_from_slice(&lane[5..]);
        }

        let with_channels = |c: usize| {
            let mut shape = head.shape()[..4].to_vec();
            shape.push(c);
            shape
        };

        Ok(Self {
            box_deltas: TensorData::new(with_channels(4), box_deltas)?,
            objectness: TensorData::new(with_channels(1), objectness)?,
            class_logits: TensorData::new(with_channels(classes), class_logits)?,
        })
    }

    fn validate(&self, scale: usize, anchors: usize) -> Result<GridDims, DecodeError> {
        for (grid, tensor) in [
            ("box", &self.box_deltas),
            ("objectness", &self.objectness),
            ("class", &self.class_logits),
        ] {
            if tensor.rank() != 5 {
                return Err(DecodeError::Rank {
                    scale,
                    grid,
                    expected: 5,
                    actual: tensor.rank(),
                });
            }
        }

        let reference = &self.box_deltas.shape()[..4];
        for (grid, tensor) in [("objectness", &self.objectness), ("class", &self.class_logits)] {
            if &tensor.shape()[..4] != reference {
                return Err(DecodeError::GridMismatch {
                    scale,
                    grid,
                    expected: reference.to_vec(),
                    actual: tensor.shape()[..4].to_vec(),
                });
            }
        }

        let dims = GridDims {
            batch: reference[0],
            height: reference[1],
            width: reference[2],
            anchors: reference[3],
            classes: self.class_logits.shape()[4],
        };

        if dims.anchors != anchors {
            return Err(DecodeError::AnchorCount {
                scale,
                expected: anchors,
                actual: dims.anchors,
            });
        }
        for (grid, tensor, expected) in [("box", &self.box_deltas, 4), ("objectness", &self.objectness, 1)] {
            if tensor.shape()[4] != expected {
                return Err(DecodeError::ChannelCount {
                    scale,
                    grid,
                    expected,
                    actual: tensor.shape()[4],
                });
            }
        }
        if dims.classes == 0 {
            return Err(DecodeError::NoClasses { scale });
        }

        Ok(dims)
    }
}

/// Raw head output for every scale, coarse to fine in model order.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetectionTensors {
    pub scales: Vec<ScaleTensors>,
}

impl RawDetectionTensors {
    pub fn new(scales: Vec<ScaleTensors>) -> Self {
        Self { scales }
    }

    /// Build from fused per-scale head outputs.
    pub fn from_fused(heads: &[TensorData]) -> Result<Self, DecodeError> {
        let scales = heads
            .iter()
            .enumerate()
            .map(|(scale, head)| ScaleTensors::from_fused(head, scale))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scales })
    }
}

#[derive(Clone, Copy, Debug)]
struct GridDims {
    batch: usize,
    height: usize,
    width: usize,
    anchors: usize,
    classes: usize,
}

/// Optional post-filters applied by the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DecodeOptions {
    /// Cells whose best objectness is strictly below this are dropped.
    pub confidence_threshold: Option<f32>,
    /// Keep at most this many detections per image.
    pub max_detections: Option<usize>,
}

// ----------------------------------------------------------------------------
// Decoder
// ----------------------------------------------------------------------------

/// Stateless decoder bound to one model's anchor priors.
#[derive(Clone, Debug)]
pub struct DetectionDecoder {
    anchors: AnchorSet,
}

impl DetectionDecoder {
    pub fn new(anchors: AnchorSet) -> Self {
        Self { anchors }
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    /// Decode every image in the batch. Output has one entry per image.
    pub fn decode(
        &self,
        tensors: &RawDetectionTensors,
        options: DecodeOptions,
    ) -> Result<Vec<DetectionResult>, DecodeError> {
        if tensors.scales.len() != self.anchors.num_scales() {
            return Err(DecodeError::ScaleCount {
                expected: self.anchors.num_scales(),
                actual: tensors.scales.len(),
            });
        }

        let mut dims = Vec::with_capacity(tensors.scales.len());
        for (scale, tensors) in tensors.scales.iter().enumerate() {
            let scale_dims = tensors.validate(scale, self.anchors.anchors_per_scale())?;
            if let Some(first) = dims.first().map(|d: &GridDims| d.batch) {
                if scale_dims.batch != first {
                    return Err(DecodeError::BatchMismatch {
                        scale,
                        expected: first,
                        actual: scale_dims.batch,
                    });
                }
            }
            dims.push(scale_dims);
        }

        let batch = dims.first().map(|d| d.batch).unwrap_or(0);
        let results = (0..batch)
            .map(|image| {
                let mut result = DetectionResult::empty(BoxEncoding::CenterNormalized);
                for (scale, (tensors, dims)) in tensors.scales.iter().zip(&dims).enumerate() {
                    self.decode_scale(&mut result, image, scale, tensors, *dims, options.confidence_threshold);
                }
                cap_detections(result, options.max_detections)
            })
            .collect();

        Ok(results)
    }

    fn decode_scale(
        &self,
        out: &mut DetectionResult,
        image: usize,
        scale: usize,
        tensors: &ScaleTensors,
        dims: GridDims,
        threshold: Option<f32>,
    ) {
        let grid_h = dims.height as f32;
        let grid_w = dims.width as f32;

        for row in 0..dims.height {
            for col in 0..dims.width {
                let objectness = tensors.objectness.lane(&[image, row, col]);
                let (best, score) = argmax(objectness);

                if let Some(threshold) = threshold {
                    if score < threshold {
                        continue;
                    }
                }

                let deltas = tensors.box_deltas.lane(&[image, row, col, best]);
                let (anchor_w, anchor_h) = self.anchors.anchor(scale, best);
                let bbox = [
                    (sigmoid(deltas[0]) + row as f32) / grid_h,
                    (sigmoid(deltas[1]) + col as f32) / grid_w,
                    deltas[2].exp() * anchor_w,
                    deltas[3].exp() * anchor_h,
                ];

                let (label, _) = argmax(tensors.class_logits.lane(&[image, row, col, best]));
                out.push(bbox, score, label);
            }
        }
    }
}

/// Keep the `max` highest scores, ties in original order, sorted descending.
fn cap_detections(result: DetectionResult, max: Option<usize>) -> DetectionResult {
    match max {
        Some(max) if result.len() > max => {
            let scores = result.scores();
            let mut order: Vec<usize> = (0..result.len()).collect();
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
            order.truncate(max);
            result.select(&order)
        }
        _ => result,
    }
}

/// Index and value of the first maximum.
fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = (0, values[0]);
    for (index, &value) in values.iter().enumerate().skip(1) {
        if value > best.1 {
            best = (index, value);
        }
    }
    best
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_scale(height: usize, width: usize, anchors: usize, classes: usize, objectness: &[f32]) -> ScaleTensors {
        let cells = height * width * anchors;
        ScaleTensors {
            box_deltas: TensorData::filled(vec![1, height, width, anchors, 4], 0.0),
            objectness: TensorData::new(vec![1, height, width, anchors, 1], objectness.to_vec()).unwrap(),
            class_logits: TensorData::new(
                vec![1, height, width, anchors, classes],
                (0..cells * classes).map(|v| (v % classes) as f32).collect(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.2, 0.9, 0.9]), (1, 0.9));
    }

    #[test]
    fn picks_best_anchor_within_cell() {
        let anchors = AnchorSet::new(vec![vec![(1.0, 2.0), (3.0, 4.0)]]).unwrap();
        let decoder = DetectionDecoder::new(anchors);
        let tensors = RawDetectionTensors::new(vec![single_scale(1, 1, 2, 2, &[0.3, 0.8])]);

        let results = decoder.decode(&tensors, DecodeOptions::default()).unwrap();
        let result = &results[0];
        assert_eq!(result.len(), 1);
        assert_eq!(result.scores(), &[0.8]);
        assert_eq!(result.boxes()[0], [0.5, 0.5, 3.0, 4.0]);
        assert_eq!(result.labels(), &[1]);
    }

    #[test]
    fn first_box_channel_follows_rows() {
        let anchors = AnchorSet::new(vec![vec![(1.0, 1.0)]]).unwrap();
        let decoder = DetectionDecoder::new(anchors);
        let tensors = RawDetectionTensors::new(vec![single_scale(2, 4, 1, 1, &[0.9; 8])]);

        let result = &decoder.decode(&tensors, DecodeOptions::default()).unwrap()[0];
        // cell (row 1, col 2) is the seventh in row-major order
        let bbox = result.boxes()[6];
        assert!((bbox[0] - 1.5 / 2.0).abs() < 1e-6);
        assert!((bbox[1] - 2.5 / 4.0).abs() < 1e-6);
    }

    #[test]
    fn scale_count_mismatch_is_structural() {
        let anchors = AnchorSet::new(vec![vec![(1.0, 1.0)], vec![(2.0, 2.0)]]).unwrap();
        let decoder = DetectionDecoder::new(anchors);
        let tensors = RawDetectionTensors::new(vec![single_scale(1, 1, 1, 1, &[0.5])]);

        let err = decoder.decode(&tensors, DecodeOptions::default()).unwrap_err();
        assert_eq!(err, DecodeError::ScaleCount { expected: 2, actual: 1 });
    }

    #[test]
    fn anchor_count_mismatch_is_structural() {
        let anchors = AnchorSet::new(vec![vec![(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]]).unwrap();
        let decoder = DetectionDecoder::new(anchors);
        let tensors = RawDetectionTensors::new(vec![single_scale(1, 1, 2, 1, &[0.5, 0.5])]);

        let err = decoder.decode(&tensors, DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::AnchorCount { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn fused_heads_split_into_grids() {
        // one cell, one anchor, channels: 4 box + objectness + 2 classes
        let head = TensorData::new(vec![1, 1, 1, 1, 7], vec![0.0, 0.0, 0.0, 0.0, 0.6, -1.0, 2.0]).unwrap();
        let tensors = RawDetectionTensors::from_fused(&[head]).unwrap();
        let scale = &tensors.scales[0];

        assert_eq!(scale.objectness.data(), &[0.6]);
        assert_eq!(scale.class_logits.shape(), &[1, 1, 1, 1, 2]);
        assert_eq!(scale.class_logits.data(), &[-1.0, 2.0]);
    }

    #[test]
    fn empty_anchor_sets_are_rejected() {
        assert!(AnchorSet::new(vec![]).is_err());
        assert!(AnchorSet::new(vec![vec![]]).is_err());
        assert!(AnchorSet::new(vec![vec![(1.0, 1.0)], vec![]]).is_err());
    }
}
