use anyhow::Result;
use image::RgbImage;

use super::result::DetectionResult;
use super::tensor::TensorData;

/// Detector backend trait.
///
/// Backends are shared between tracks and invoked from blocking worker
/// threads, so `detect` takes `&self` and implementations must be `Sync`.
pub trait DetectorBackend: Send + Sync {
    /// Model id this backend serves.
    fn name(&self) -> &str;

    /// Run detection on one RGB image.
    ///
    /// `confidence_threshold` overrides the backend default when supplied.
    fn detect(&self, image: &RgbImage, confidence_threshold: Option<f32>) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Raw inference capability: image in, head output tensors out.
///
/// Model weights and graph execution live behind this trait; decoding lives
/// in the backends that wrap it.
pub trait TensorModel: Send + Sync {
    /// Model input size as `(width, height)`.
    fn input_size(&self) -> (u32, u32);

    /// Run the network. One tensor per output head, in model order.
    fn forward(&self, image: &RgbImage) -> Result<Vec<TensorData>>;
}
