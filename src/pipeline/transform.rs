use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use log::debug;

use super::annotate::{Annotator, RateOverlay};
use super::rates::MetricsHandle;
use crate::detect::{BackendRegistry, DetectorBackend};
use crate::frame::Frame;

/// Per-frame processing step run off the orchestration thread.
pub trait FrameTransform: Send + Sync {
    /// Produce the frame to publish. Must not mutate `frame`.
    fn transform(&self, frame: &Frame) -> Result<Frame>;

    /// True when frames should be published as-is without scheduling a job.
    fn passes_through(&self) -> bool {
        false
    }
}

/// Transform selected by name in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformKind {
    PassThrough,
    Detect,
    Delay,
}

impl FromStr for TransformKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "pass-through" | "none" => Ok(TransformKind::PassThrough),
            "detect" | "detection" => Ok(TransformKind::Detect),
            "delay" | "dummy" => Ok(TransformKind::Delay),
            other => bail!("unknown transform '{}' (expected passthrough, detect or delay)", other),
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformKind::PassThrough => write!(f, "passthrough"),
            TransformKind::Detect => write!(f, "detect"),
            TransformKind::Delay => write!(f, "delay"),
        }
    }
}

/// The closed set of transforms a track can run.
pub enum TransformStrategy {
    PassThrough,
    Detect(DetectTransform),
    /// Sleep, then return the frame unchanged.
    Delay(Duration),
}

/// Detection settings resolved from configuration.
#[derive(Clone, Debug, Default)]
pub struct TransformOptions {
    pub model_id: Option<String>,
    pub confidence_threshold: Option<f32>,
    pub delay: Duration,
    /// Font for box labels and the rate caption; outlines only when unset.
    pub font_path: Option<PathBuf>,
    /// Track metrics shown in the rate caption.
    pub metrics: Option<MetricsHandle>,
}

impl TransformStrategy {
    /// Resolve `kind` once, at track construction.
    pub fn resolve(kind: TransformKind, backends: &BackendRegistry, options: &TransformOptions) -> Result<Self> {
        Ok(match kind {
            TransformKind::PassThrough => TransformStrategy::PassThrough,
            TransformKind::Delay => TransformStrategy::Delay(options.delay),
            TransformKind::Detect => {
                let backend = backends.resolve(options.model_id.as_deref())?;
                let annotator = match &options.font_path {
                    Some(path) => Annotator::with_font_file(path)?,
                    None => Annotator::new(),
                };
                let mut detect = DetectTransform::new(backend, options.confidence_threshold).with_annotator(annotator);
                if let Some(metrics) = &options.metrics {
                    detect = detect.with_metrics(metrics.clone());
                }
                TransformStrategy::Detect(detect)
            }
        })
    }

    pub fn kind(&self) -> TransformKind {
        match self {
            TransformStrategy::PassThrough => TransformKind::PassThrough,
            TransformStrategy::Detect(_) => TransformKind::Detect,
            TransformStrategy::Delay(_) => TransformKind::Delay,
        }
    }
}

impl FrameTransform for TransformStrategy {
    fn transform(&self, frame: &Frame) -> Result<Frame> {
        match self {
            TransformStrategy::PassThrough => Ok(frame.duplicate()),
            TransformStrategy::Detect(detect) => detect.transform(frame),
            TransformStrategy::Delay(delay) => {
                std::thread::sleep(*delay);
                Ok(frame.duplicate())
            }
        }
    }

    fn passes_through(&self) -> bool {
        matches!(self, TransformStrategy::PassThrough)
    }
}

/// Runs a detector and draws its boxes on a copy of the frame.
pub struct DetectTransform {
    backend: Arc<dyn DetectorBackend>,
    confidence_threshold: Option<f32>,
    annotator: Annotator,
    metrics: Option<MetricsHandle>,
}

impl DetectTransform {
    pub fn new(backend: Arc<dyn DetectorBackend>, confidence_threshold: Option<f32>) -> Self {
        Self {
            backend,
            confidence_threshold,
            annotator: Annotator::new(),
            metrics: None,
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    /// Read the caption rates from `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl FrameTransform for DetectTransform {
    fn transform(&self, frame: &Frame) -> Result<Frame> {
        let detections = self.backend.detect(frame.image(), self.confidence_threshold)?;
        debug!(
            "{}: {} detections on frame {}",
            self.backend.name(),
            detections.len(),
            frame.sequence
        );
        let rates = self.metrics.as_ref().map(|metrics| {
            let snapshot = metrics.snapshot();
            RateOverlay {
                decoding_fps: snapshot.fps_decoding,
                detection_fps: snapshot.fps_detection,
            }
        });
        Ok(frame.with_image(self.annotator.annotate(frame.image(), &detections, rates)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use image::{Rgb, RgbImage};

    #[test]
    fn kinds_parse_case_insensitively() -> Result<()> {
        assert_eq!("Detect".parse::<TransformKind>()?, TransformKind::Detect);
        assert_eq!(" passthrough ".parse::<TransformKind>()?, TransformKind::PassThrough);
        assert!("blur".parse::<TransformKind>().is_err());
        Ok(())
    }

    #[test]
    fn detect_keeps_timing_and_leaves_input_untouched() -> Result<()> {
        let mut backends = BackendRegistry::new();
        backends.register(StubBackend::with_grid(1, 1));
        let strategy = TransformStrategy::resolve(
            TransformKind::Detect,
            &backends,
            &TransformOptions {
                confidence_threshold: Some(0.5),
                ..TransformOptions::default()
            },
        )?;

        let image = RgbImage::from_pixel(8, 8, Rgb([200, 200, 200]));
        let frame = Frame::new(image, 9, Duration::from_millis(600));
        let out = strategy.transform(&frame)?;

        assert_eq!((out.sequence, out.pts), (9, Duration::from_millis(600)));
        assert_eq!(out.image().get_pixel(0, 0).0, [0, 255, 0]);
        assert_eq!(frame.image().get_pixel(0, 0).0, [200, 200, 200]);
        Ok(())
    }

    #[test]
    fn detect_requires_a_loaded_model() {
        let backends = BackendRegistry::new();
        let options = TransformOptions {
            model_id: Some("fence-detection".into()),
            ..TransformOptions::default()
        };
        assert!(TransformStrategy::resolve(TransformKind::Detect, &backends, &options).is_err());
    }

    #[test]
    fn detect_rejects_an_unreadable_font() {
        let mut backends = BackendRegistry::new();
        backends.register(StubBackend::new());
        let options = TransformOptions {
            font_path: Some("/nonexistent/label-font.ttf".into()),
            ..TransformOptions::default()
        };
        assert!(TransformStrategy::resolve(TransformKind::Detect, &backends, &options).is_err());
    }
}
