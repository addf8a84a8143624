use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::detect::backend::{DetectorBackend, TensorModel};
use crate::detect::result::{BoxEncoding, DetectionResult};
use crate::detect::yolo::{decode_yolo_head, YoloDecodeOptions};

/// Anchor-free detector returning pixel-corner boxes in frame coordinates.
pub struct YoloBackend {
    id: String,
    model: Box<dyn TensorModel>,
    options: YoloDecodeOptions,
    names: BTreeMap<usize, String>,
}

impl YoloBackend {
    pub fn new(id: impl Into<String>, model: Box<dyn TensorModel>) -> Self {
        Self {
            id: id.into(),
            model,
            options: YoloDecodeOptions::default(),
            names: BTreeMap::new(),
        }
    }

    pub fn with_options(mut self, options: YoloDecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_names(mut self, names: BTreeMap<usize, String>) -> Self {
        self.names = names;
        self
    }
}

impl DetectorBackend for YoloBackend {
    fn name(&self) -> &str {
        &self.id
    }

    fn detect(&self, image: &RgbImage, confidence_threshold: Option<f32>) -> Result<DetectionResult> {
        let heads = self
            .model
            .forward(image)
            .with_context(|| format!("model '{}' inference failed", self.id))?;
        let head = heads
            .first()
            .ok_or_else(|| anyhow!("model '{}' produced no outputs", self.id))?;

        let mut options = self.options;
        if let Some(threshold) = confidence_threshold {
            options.confidence_threshold = threshold;
        }

        let mut result = decode_yolo_head(head, options)?
            .into_iter()
            .next()
            .unwrap_or_else(|| DetectionResult::empty(BoxEncoding::CornersPixels));

        let (input_w, input_h) = self.model.input_size();
        let sx = image.width() as f32 / input_w.max(1) as f32;
        let sy = image.height() as f32 / input_h.max(1) as f32;
        result.map_boxes(|b| [b[0] * sx, b[1] * sy, b[2] * sx, b[3] * sy]);

        Ok(result.with_names(self.names.clone()))
    }
}
