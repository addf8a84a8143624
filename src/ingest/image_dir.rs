use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::SourceConfig;
use crate::frame::Frame;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Still images from a local directory (`dir://path`), played once in name order.
pub(crate) struct ImageDirSource {
    config: SourceConfig,
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    frames_emitted: u64,
}

impl ImageDirSource {
    pub(crate) fn new(config: SourceConfig) -> Result<Self> {
        let dir = config
            .url
            .strip_prefix("dir://")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("image directory URLs must start with dir://"))?;
        Ok(Self {
            config,
            dir,
            files: Vec::new(),
            cursor: 0,
            frames_emitted: 0,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list image directory {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                files.push(path);
            }
        }
        files.sort();

        log::info!(
            "VideoSource: connected to {} ({} images)",
            self.config.url,
            files.len()
        );
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    /// Decode the next file. An undecodable file yields an error and is skipped
    /// on the following call.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;

        let image = image::open(&path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();

        let sequence = self.frames_emitted;
        self.frames_emitted += 1;
        let pts = self.config.pts_for(sequence);
        Ok(Some(Frame::new(image, sequence, pts)))
    }

    pub(crate) fn interval(&self) -> Duration {
        self.config.frame_interval()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn undecodable_files_are_reported_and_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::new(4, 3).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("b.png"), b"not a png")?;
        RgbImage::new(2, 2).save(dir.path().join("c.png"))?;
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut source = ImageDirSource::new(SourceConfig {
            url: format!("dir://{}", dir.path().display()),
            ..SourceConfig::default()
        })?;
        source.connect()?;

        let first = source.next_frame()?.ok_or_else(|| anyhow!("missing a.png"))?;
        assert_eq!((first.width(), first.height(), first.sequence), (4, 3, 0));

        assert!(source.next_frame().is_err());

        let third = source.next_frame()?.ok_or_else(|| anyhow!("missing c.png"))?;
        assert_eq!((third.width(), third.sequence), (2, 1));

        assert!(source.next_frame()?.is_none());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }
}
