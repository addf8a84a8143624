//! Latest-frame-wins inference scheduling for one track.
//!
//! At most one inference job runs per track. While it runs, arriving frames
//! are counted and answered with the currently published frame; they are
//! never queued. When the job finishes, its result message comes back over a
//! channel the scheduler owns and the scheduler alone swaps the published
//! frame. Failures and timeouts leave the published frame as it was.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::pool::WorkerPool;
use super::rates::{MetricsHandle, RateSample, RateWindow};
use super::transform::FrameTransform;
use crate::frame::{Frame, SharedFrame};

const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether an inference job is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackPhase {
    Idle,
    Processing,
}

/// What applying a completion did to the track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The annotated frame with this sequence number is now published.
    Published { sequence: u64 },
    /// The job failed or timed out; the published frame is unchanged.
    Failed,
    /// Result of a job that was cancelled before it reported; ignored.
    Stale,
}

/// Lifetime counters for one track.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerCounters {
    pub received: u64,
    pub processed: u64,
    pub sent_to_inference: u64,
    pub failed: u64,
}

struct InFlight {
    job_id: u64,
    handle: JoinHandle<()>,
}

/// A finished job. Latency and the inference timeout cover the transform
/// only, not the wait for a worker permit.
struct JobOutcome {
    job_id: u64,
    result: Result<(Frame, Duration)>,
}

pub struct FrameScheduler {
    track: String,
    transform: Arc<dyn FrameTransform>,
    pool: WorkerPool,
    inference_timeout: Duration,
    published: Option<SharedFrame>,
    in_flight: Option<InFlight>,
    next_job_id: u64,
    outcomes_tx: mpsc::UnboundedSender<JobOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<JobOutcome>,
    window: RateWindow,
    counters: SchedulerCounters,
    last_latency: Option<Duration>,
    metrics: MetricsHandle,
}

impl FrameScheduler {
    pub fn new(track: impl Into<String>, transform: Arc<dyn FrameTransform>, pool: WorkerPool, metrics: MetricsHandle) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            track: track.into(),
            transform,
            pool,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            published: None,
            in_flight: None,
            next_job_id: 0,
            outcomes_tx,
            outcomes_rx,
            window: RateWindow::new(Instant::now()),
            counters: SchedulerCounters::default(),
            last_latency: None,
            metrics,
        }
    }

    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn track(&self) -> &str {
        &self.track
    }

    pub fn phase(&self) -> TrackPhase {
        if self.in_flight.is_some() {
            TrackPhase::Processing
        } else {
            TrackPhase::Idle
        }
    }

    pub fn published(&self) -> Option<&SharedFrame> {
        self.published.as_ref()
    }

    pub fn counters(&self) -> SchedulerCounters {
        self.counters
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    /// Handle a newly decoded frame and return the frame to republish.
    ///
    /// Never blocks. When idle, the frame is handed to the worker pool and the
    /// previously published frame is returned; the first frame of a stream is
    /// published as-is until its result arrives.
    pub fn on_frame_arrived(&mut self, frame: Frame) -> SharedFrame {
        self.counters.received += 1;
        self.window.record_received();

        let frame = Arc::new(frame);
        let published = self.published.get_or_insert_with(|| Arc::clone(&frame)).clone();

        if self.transform.passes_through() {
            self.published = Some(Arc::clone(&frame));
            self.sync_counters();
            return frame;
        }

        if self.in_flight.is_none() {
            self.launch(frame);
        }
        self.sync_counters();
        published
    }

    fn launch(&mut self, frame: SharedFrame) {
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let transform = Arc::clone(&self.transform);
        let pool = self.pool.clone();
        let outcomes = self.outcomes_tx.clone();
        let timeout = self.inference_timeout;
        let handle = tokio::spawn(async move {
            let result = async {
                let slot = pool.acquire().await?;
                let job = slot.run(move || {
                    let started = std::time::Instant::now();
                    let out = transform.transform(&frame)?;
                    Ok((out, started.elapsed()))
                });
                tokio::time::timeout(timeout, job)
                    .await
                    .map_err(|_| anyhow!("inference timed out after {:?}", timeout))?
            }
            .await;
            let _ = outcomes.send(JobOutcome { job_id, result });
        });

        self.counters.sent_to_inference += 1;
        self.in_flight = Some(InFlight { job_id, handle });
    }

    /// Wait for the in-flight job to report and apply its result.
    ///
    /// Pending forever while idle. Cancel safe: a completion is applied in the
    /// same poll that receives it.
    pub async fn next_completion(&mut self) -> Completion {
        match self.outcomes_rx.recv().await {
            Some(outcome) => self.apply(outcome),
            None => std::future::pending().await,
        }
    }

    fn apply(&mut self, outcome: JobOutcome) -> Completion {
        match &self.in_flight {
            Some(in_flight) if in_flight.job_id == outcome.job_id => {}
            _ => return Completion::Stale,
        }
        self.in_flight = None;

        let completion = match outcome.result {
            Ok((frame, latency)) => {
                let sequence = frame.sequence;
                self.published = Some(Arc::new(frame));
                self.counters.processed += 1;
                self.window.record_processed();
                self.last_latency = Some(latency);
                debug!("{}: frame {} processed in {:?}", self.track, sequence, latency);
                Completion::Published { sequence }
            }
            Err(err) => {
                self.counters.failed += 1;
                warn!("{}: inference failed, keeping last frame: {:#}", self.track, err);
                Completion::Failed
            }
        };
        self.sync_counters();
        completion
    }

    /// Close the current rate window and publish the rates.
    pub fn report_rates(&mut self, now: Instant) -> RateSample {
        let sample = self.window.report(now);
        self.metrics.update(|metrics| {
            metrics.fps_decoding = sample.decoded_fps;
            metrics.fps_detection = sample.detected_fps;
        });
        debug!(
            "{}: decoding {:.1} fps, detection {:.1} fps",
            self.track, sample.decoded_fps, sample.detected_fps
        );
        sample
    }

    /// Abort the in-flight job, if any. Its result, should it still arrive,
    /// is discarded.
    pub fn cancel(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
            debug!("{}: cancelled inference job {}", self.track, in_flight.job_id);
        }
    }

    fn sync_counters(&self) {
        let counters = self.counters;
        let latency = self.last_latency;
        self.metrics.update(|metrics| {
            metrics.frames_received = counters.received;
            metrics.frames_processed = counters.processed;
            metrics.frames_sent_to_inference = counters.sent_to_inference;
            metrics.inference_failures = counters.failed;
            metrics.detection_time = latency;
        });
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
