use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::Duration;

use super::SourceConfig;
use crate::frame::Frame;

/// Synthetic scene for `stub://` URLs.
///
/// A dim gradient background with a bright square sweeping left to right, so
/// luminance-based detectors have something that moves.
pub(crate) struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub(crate) fn new(config: SourceConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        log::info!("VideoSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let sequence = self.frame_count;
        self.frame_count += 1;

        let pts = self.config.pts_for(sequence);
        Ok(Some(Frame::new(self.render(sequence), sequence, pts)))
    }

    fn render(&self, sequence: u64) -> RgbImage {
        let (width, height) = (self.config.width, self.config.height);
        let side = (width.min(height) / 4).max(1);
        let travel = u64::from(width.saturating_sub(side).max(1));
        let left = ((sequence * 8) % travel) as u32;
        let top = (height.saturating_sub(side)) / 2;

        RgbImage::from_fn(width, height, |x, y| {
            if (left..left + side).contains(&x) && (top..top + side).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                let shade = (40 * y / height.max(1)) as u8;
                Rgb([shade, shade, shade + 10])
            }
        })
    }

    pub(crate) fn interval(&self) -> Duration {
        self.config.frame_interval()
    }
}
