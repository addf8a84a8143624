//! Process wiring: backends, source, track, telemetry listener and broadcaster.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::detect::{BackendRegistry, StubBackend};
use crate::frame::SharedFrame;
use crate::ingest::{MediaSource, VideoSource};
use crate::models;
use crate::pipeline::{
    FrameScheduler, InstrumentedTrack, SchedulerCounters, StatsBoard, TransformOptions, TransformStrategy, WorkerPool,
};
use crate::telemetry::{ConnectionRegistry, TelemetryBroadcaster};
use crate::transport::TelemetryListener;

/// Log republished frames every this many frames.
const REPUBLISH_LOG_EVERY: u64 = 100;

/// Backends for every loadable registry model, plus the stub detector.
pub fn build_backends(config: &RelayConfig) -> Result<BackendRegistry> {
    let mut backends = BackendRegistry::new();
    if let Some(path) = &config.model_registry {
        let records = models::load_registry(path)?;
        let loaded = backends.load_records(&records, config.pipeline.max_detections);
        info!("model registry {}: {} of {} models loaded", path.display(), loaded, records.len());
    }
    backends.register(StubBackend::new());
    Ok(backends)
}

/// Run one track until its source ends or `shutdown` becomes true, serving
/// telemetry alongside. Returns the track's lifetime counters.
pub async fn run(config: RelayConfig, shutdown: watch::Receiver<bool>) -> Result<SchedulerCounters> {
    let backends = build_backends(&config)?;
    let board = StatsBoard::new();
    let track_name = config.pipeline.track_name.clone();
    let metrics = board.register(&track_name);

    let options = TransformOptions {
        model_id: config.pipeline.model_id.clone(),
        confidence_threshold: Some(config.pipeline.confidence_threshold),
        delay: config.pipeline.delay,
        font_path: config.pipeline.font_path.clone(),
        metrics: Some(metrics.clone()),
    };
    let transform = TransformStrategy::resolve(config.pipeline.transform, &backends, &options)?;
    info!("transform: {} (models: {})", transform.kind(), backends.list().join(", "));

    let pool = WorkerPool::new(config.pipeline.workers);
    let connections = ConnectionRegistry::with_max_producers(config.telemetry.max_producers);

    let mut source = VideoSource::new(config.source.clone())?;
    source.connect()?;
    let stream = source.subscribe()?;

    let scheduler = FrameScheduler::new(&track_name, Arc::new(transform), pool, metrics)
        .with_inference_timeout(config.pipeline.inference_timeout);
    let track = InstrumentedTrack::new(stream, scheduler, config.pipeline.rate_window);
    let republisher = spawn_republisher(track.subscribe(), track_name.clone());

    let listener =
        TelemetryListener::bind(config.telemetry.addr.as_str(), connections.clone(), vec![track_name.clone()]).await?;
    let broadcaster = TelemetryBroadcaster::new(connections.clone(), board.clone(), &config.telemetry).spawn();
    info!("relaying {} as track '{}'", config.source.url, track_name);

    let counters = track.run(shutdown).await;

    broadcaster.shutdown();
    drop(listener);
    republisher.abort();
    connections.clear();
    board.remove(&track_name);
    Ok(counters)
}

/// Downstream consumer of the republished stream.
fn spawn_republisher(mut frames: broadcast::Receiver<SharedFrame>, track: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut published = 0u64;
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    published += 1;
                    if published % REPUBLISH_LOG_EVERY == 0 {
                        debug!("{}: republished {} frames (latest sequence {})", track, published, frame.sequence);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("{}: republisher skipped {} frames", track, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
