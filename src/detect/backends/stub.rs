use std::collections::BTreeMap;

use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::decode::{AnchorSet, DecodeOptions, DetectionDecoder, RawDetectionTensors, ScaleTensors};
use crate::detect::result::DetectionResult;
use crate::detect::tensor::TensorData;

/// Deterministic backend for tests and the synthetic pipeline.
///
/// Splits the image into a `rows x cols` grid and treats each cell's mean
/// luminance as objectness, then runs the regular anchor-head decoder. Bright
/// cells are labelled `bright`, dark ones `dark`.
pub struct StubBackend {
    rows: usize,
    cols: usize,
    decoder: DetectionDecoder,
}

impl StubBackend {
    pub const NAME: &'static str = "stub";

    pub fn new() -> Self {
        Self::with_grid(4, 4)
    }

    pub fn with_grid(rows: usize, cols: usize) -> Self {
        let (rows, cols) = (rows.max(1), cols.max(1));
        let anchors = AnchorSet::single(1.0 / cols as f32, 1.0 / rows as f32);
        Self {
            rows,
            cols,
            decoder: DetectionDecoder::new(anchors),
        }
    }

    fn luminance_grid(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let mut sums = vec![0f32; self.rows * self.cols];
        let mut counts = vec![0u32; self.rows * self.cols];

        for (x, y, pixel) in image.enumerate_pixels() {
            let row = (y as usize * self.rows) / height.max(1);
            let col = (x as usize * self.cols) / width.max(1);
            let [r, g, b] = pixel.0;
            let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            sums[row * self.cols + col] += luma / 255.0;
            counts[row * self.cols + col] += 1;
        }

        sums.iter()
            .zip(&counts)
            .map(|(sum, count)| if *count == 0 { 0.0 } else { sum / *count as f32 })
            .collect()
    }

    fn tensors(&self, image: &RgbImage) -> Result<RawDetectionTensors> {
        let objectness = self.luminance_grid(image);
        let logits: Vec<f32> = objectness.iter().flat_map(|o| [*o, 1.0 - *o]).collect();
        let grid = |channels: usize| vec![1, self.rows, self.cols, 1, channels];

        Ok(RawDetectionTensors::new(vec![ScaleTensors {
            box_deltas: TensorData::filled(grid(4), 0.0),
            objectness: TensorData::new(grid(1), objectness)?,
            class_logits: TensorData::new(grid(2), logits)?,
        }]))
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn detect(&self, image: &RgbImage, confidence_threshold: Option<f32>) -> Result<DetectionResult> {
        let tensors = self.tensors(image)?;
        let options = DecodeOptions {
            confidence_threshold,
            max_detections: None,
        };
        let result = self
            .decoder
            .decode(&tensors, options)?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(result.with_names(BTreeMap::from([(0, "bright".to_string()), (1, "dark".to_string())])))
    }
}
