//! Per-track frame processing: scheduling, transforms and rate accounting.

mod annotate;
mod pool;
mod rates;
mod scheduler;
mod track;
mod transform;

pub use annotate::{detection_label, draw_detections, rate_caption, Annotator, RateOverlay};
pub use pool::{WorkerPool, WorkerSlot};
pub use rates::{MetricsHandle, RateSample, RateWindow, StatsBoard, TrackMetrics};
pub use scheduler::{Completion, FrameScheduler, SchedulerCounters, TrackPhase};
pub use track::InstrumentedTrack;
pub use transform::{DetectTransform, FrameTransform, TransformKind, TransformOptions, TransformStrategy};
