//! Frame container shared by sources, the scheduler and transforms.
//!
//! - `Frame`: RGB pixels plus presentation timestamp and sequence number.
//! - `SharedFrame`: the reference-counted form that gets published downstream.
//!
//! Published frames are never mutated. A transform that wants to draw on a
//! frame builds a new one with `Frame::with_image`, which keeps the original
//! timing metadata (copy-on-annotate).

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A frame as published to downstream consumers.
pub type SharedFrame = Arc<Frame>;

pub struct Frame {
    image: RgbImage,

    /// Monotonic sequence number assigned by the source.
    pub sequence: u64,

    /// Presentation timestamp relative to the start of the stream.
    pub pts: Duration,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64, pts: Duration) -> Self {
        Self {
            image,
            sequence,
            pts,
        }
    }

    /// Build a frame from packed RGB bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64, pts: Duration) -> Result<Self> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;

        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }

        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, sequence, pts))
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// New frame carrying `image` with this frame's timestamp and sequence.
    pub fn with_image(&self, image: RgbImage) -> Frame {
        Frame {
            image,
            sequence: self.sequence,
            pts: self.pts,
        }
    }

    /// Deep copy of the pixels with the same timing metadata.
    pub fn duplicate(&self) -> Frame {
        self.with_image(self.image.clone())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("pts", &self.pts)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}
