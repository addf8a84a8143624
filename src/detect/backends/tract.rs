#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::TensorModel;
use crate::detect::tensor::TensorData;

/// ONNX model executed with tract.
///
/// Frames are resized to the model input, scaled to `0..1` and fed as a
/// `[1, 3, H, W]` tensor. Every graph output is returned as a `TensorData`.
pub struct TractModel {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
}

impl TractModel {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, height as usize, width as usize)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, width, height })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized;
        let image = if image.dimensions() == (self.width, self.height) {
            image
        } else {
            resized = imageops::resize(image, self.width, self.height, FilterType::Triangle);
            &resized
        };

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| image.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        )
        .into_tensor()
    }
}

impl TensorModel for TractModel {
    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn forward(&self, image: &RgbImage) -> Result<Vec<TensorData>> {
        let input = self.build_input(image);
        let outputs = self.model.run(tvec!(input.into())).context("ONNX inference failed")?;
        if outputs.is_empty() {
            return Err(anyhow!("model produced no outputs"));
        }

        outputs
            .iter()
            .map(|output| {
                let view = output.to_array_view::<f32>().context("model output tensor was not f32")?;
                let shape = view.shape().to_vec();
                let data = view.iter().copied().collect();
                Ok(TensorData::new(shape, data)?)
            })
            .collect()
    }
}
