//! Vision relay
//!
//! Ingests a live video stream, runs an object detector on a bounded subset of
//! its frames, republishes the annotated stream and reports latency and
//! throughput telemetry to connected peers.
//!
//! # Architecture
//!
//! - **Latest-frame-wins scheduling**: at most one inference job per track;
//!   frames arriving while it runs are answered with the last published frame
//!   instead of being queued.
//! - **Anchor-head decoding**: raw multi-scale head tensors become boxes,
//!   scores and labels, one cell at a time, without suppression.
//! - **Telemetry fan-out**: every tick, each connection gets an RTT probe and a
//!   statistics record concurrently; one failing peer never blocks the rest.
//!
//! # Module Structure
//!
//! - `frame`: Frame container shared between stages
//! - `ingest`: Frame sources (synthetic, image directory)
//! - `detect`: Detector backends, decoders, result types
//! - `models`: Model registry file
//! - `pipeline`: Scheduler, transforms, worker pool, rate accounting
//! - `telemetry`: Connections, wire messages, broadcaster
//! - `transport`: TCP side-channel listener
//! - `config`: Layered configuration
//! - `relay`: Process wiring used by `relayd`

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod relay;
pub mod telemetry;
pub mod transport;

pub use config::RelayConfig;
pub use detect::{AnchorSet, DecodeError, DecodeOptions, DetectionDecoder, DetectionResult, RawDetectionTensors};
pub use frame::{Frame, SharedFrame};
pub use ingest::{FrameStream, MediaSource, SourceConfig, VideoSource};
pub use pipeline::{FrameScheduler, FrameTransform, InstrumentedTrack, TransformKind, TransformStrategy, WorkerPool};
pub use telemetry::{Connection, ConnectionRegistry, ConnectionRole, SideChannel, TelemetryBroadcaster};
