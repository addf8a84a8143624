//! Frame ingestion sources.
//!
//! This module provides different sources for decoded frames:
//! - Synthetic scene (`stub://...`), paced at the target frame rate
//! - Local image directory (`dir://path`), JPEG/PNG files in name order
//!
//! Sources are pulled on a dedicated thread and delivered in order through a
//! small bounded channel (`FrameStream`). Frames that fail to decode are
//! dropped with a warning; consumers keep republishing their last good frame.

mod image_dir;
mod synthetic;

use anyhow::{anyhow, bail, Result};
use log::{error, info, warn};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::frame::Frame;
use image_dir::ImageDirSource;
use synthetic::SyntheticSource;

/// Frames buffered between the source thread and the track.
const FRAME_CHANNEL_CAPACITY: usize = 2;

/// Give up after this many decode failures in a row.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// Configuration for a video source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://name` or `dir://path`.
    pub url: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Frame width (synthetic frames).
    pub width: u32,
    /// Frame height (synthetic frames).
    pub height: u32,
}

impl SourceConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.target_fps.max(1)))
    }

    /// Presentation time of frame `sequence` at the target rate.
    pub fn pts_for(&self, sequence: u64) -> Duration {
        let nanos = self.frame_interval().as_nanos().saturating_mul(u128::from(sequence));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 15,
            width: 640,
            height: 480,
        }
    }
}

/// A pull-based producer of decoded frames.
pub trait MediaSource: Send + 'static {
    fn describe(&self) -> String;

    /// Time between frames at the target rate.
    fn frame_interval(&self) -> Duration;

    /// Produce the next frame, blocking. `Ok(None)` ends the stream; an error
    /// drops this frame only.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Start pulling on a dedicated thread and return the in-order stream.
    ///
    /// The thread stops when the stream is dropped or the source ends.
    fn subscribe(self) -> Result<FrameStream>
    where
        Self: Sized,
    {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let name = self.describe();
        thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || pump(self, tx))
            .map_err(|e| anyhow!("failed to start source thread for {}: {}", name, e))?;
        Ok(FrameStream::new(rx))
    }
}

fn pump<S: MediaSource>(mut source: S, tx: mpsc::Sender<Frame>) {
    let interval = source.frame_interval();
    let mut failures = 0u32;

    loop {
        let started = Instant::now();
        match source.next_frame() {
            Ok(Some(frame)) => {
                failures = 0;
                if tx.blocking_send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("{}: end of stream", source.describe());
                break;
            }
            Err(err) => {
                failures += 1;
                warn!("{}: dropping frame: {:#}", source.describe(), err);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("{}: {} consecutive failures, stopping", source.describe(), failures);
                    break;
                }
            }
        }
        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

/// In-order stream of frames from a subscribed source.
pub struct FrameStream {
    rx: mpsc::Receiver<Frame>,
}

impl FrameStream {
    pub fn new(rx: mpsc::Receiver<Frame>) -> Self {
        Self { rx }
    }

    /// Next frame, or `None` once the source has ended.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// Video source selected by URL scheme.
pub struct VideoSource {
    backend: SourceBackend,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    ImageDir(ImageDirSource),
}

impl VideoSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        if config.target_fps == 0 {
            bail!("source target_fps must be greater than zero");
        }
        let backend = if config.url.starts_with("stub://") {
            SourceBackend::Synthetic(SyntheticSource::new(config))
        } else if config.url.starts_with("dir://") {
            SourceBackend::ImageDir(ImageDirSource::new(config)?)
        } else {
            bail!("unsupported source url '{}' (expected stub:// or dir://)", config.url)
        };
        Ok(Self { backend })
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.connect(),
            SourceBackend::ImageDir(source) => source.connect(),
        }
    }
}

impl MediaSource for VideoSource {
    fn describe(&self) -> String {
        match &self.backend {
            SourceBackend::Synthetic(_) => "synthetic source".to_string(),
            SourceBackend::ImageDir(_) => "image directory source".to_string(),
        }
    }

    fn frame_interval(&self) -> Duration {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.interval(),
            SourceBackend::ImageDir(source) => source.interval(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.next_frame(),
            SourceBackend::ImageDir(source) => source.next_frame(),
        }
    }
}
