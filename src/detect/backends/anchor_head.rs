use std::collections::BTreeMap;

use anyhow::{Context, Result};
use image::RgbImage;

use crate::detect::backend::{DetectorBackend, TensorModel};
use crate::detect::decode::{DecodeOptions, DetectionDecoder, RawDetectionTensors};
use crate::detect::result::{BoxEncoding, DetectionResult};

/// Anchor-head model followed by the per-cell decoder.
///
/// The wrapped model must emit one fused `[1, H, W, A, 5 + C]` tensor per
/// scale with objectness already squashed into `[0, 1]`.
pub struct AnchorHeadBackend {
    id: String,
    model: Box<dyn TensorModel>,
    decoder: DetectionDecoder,
    max_detections: Option<usize>,
    names: Option<BTreeMap<usize, String>>,
}

impl AnchorHeadBackend {
    pub fn new(id: impl Into<String>, model: Box<dyn TensorModel>, decoder: DetectionDecoder) -> Self {
        Self {
            id: id.into(),
            model,
            decoder,
            max_detections: None,
            names: None,
        }
    }

    pub fn with_max_detections(mut self, max: Option<usize>) -> Self {
        self.max_detections = max;
        self
    }

    pub fn with_names(mut self, names: BTreeMap<usize, String>) -> Self {
        if !names.is_empty() {
            self.names = Some(names);
        }
        self
    }
}

impl DetectorBackend for AnchorHeadBackend {
    fn name(&self) -> &str {
        &self.id
    }

    fn detect(&self, image: &RgbImage, confidence_threshold: Option<f32>) -> Result<DetectionResult> {
        let heads = self
            .model
            .forward(image)
            .with_context(|| format!("model '{}' inference failed", self.id))?;
        let tensors = RawDetectionTensors::from_fused(&heads)?;
        let options = DecodeOptions {
            confidence_threshold,
            max_detections: self.max_detections,
        };

        let result = self
            .decoder
            .decode(&tensors, options)?
            .into_iter()
            .next()
            .unwrap_or_else(|| DetectionResult::empty(BoxEncoding::CenterNormalized));

        Ok(match &self.names {
            Some(names) => result.with_names(names.clone()),
            None => result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::decode::AnchorSet;
    use crate::detect::tensor::TensorData;

    struct FixedHead;

    impl TensorModel for FixedHead {
        fn input_size(&self) -> (u32, u32) {
            (8, 8)
        }

        fn forward(&self, _image: &RgbImage) -> Result<Vec<TensorData>> {
            // 1x2 grid, one anchor, two classes
            let data = vec![
                0.0, 0.0, 0.0, 0.0, 0.2, 1.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, 0.7, 0.0, 1.0,
            ];
            Ok(vec![TensorData::new(vec![1, 1, 2, 1, 7], data)?])
        }
    }

    #[test]
    fn decodes_fused_heads_and_attaches_names() -> Result<()> {
        let decoder = DetectionDecoder::new(AnchorSet::new(vec![vec![(0.5, 0.5)]])?);
        let backend = AnchorHeadBackend::new("fence", Box::new(FixedHead), decoder)
            .with_names(BTreeMap::from([(0, "post".to_string()), (1, "gap".to_string())]));

        let result = backend.detect(&RgbImage::new(8, 8), Some(0.5))?;

        assert_eq!(result.len(), 1);
        assert_eq!(result.scores(), &[0.7]);
        assert_eq!(result.label_name(result.labels()[0]), Some("gap"));
        Ok(())
    }
}
