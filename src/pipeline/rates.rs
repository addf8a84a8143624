//! Throughput accounting per track.
//!
//! `RateWindow` turns received/processed counters into frames per second and
//! resets itself on every report. `TrackMetrics` is the latest snapshot a
//! track publishes on the `StatsBoard` for telemetry to read.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Counters for one reporting window.
#[derive(Debug)]
pub struct RateWindow {
    received: u64,
    processed: u64,
    started: Instant,
}

/// Rates computed at the end of a window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSample {
    pub decoded_fps: f64,
    pub detected_fps: f64,
    pub elapsed: Duration,
}

impl RateWindow {
    pub fn new(started: Instant) -> Self {
        Self {
            received: 0,
            processed: 0,
            started,
        }
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Compute rates over the elapsed window, then zero the counters and
    /// restart the window at `now`.
    pub fn report(&mut self, now: Instant) -> RateSample {
        let elapsed = now.saturating_duration_since(self.started);
        let seconds = elapsed.as_secs_f64();
        let rate = |count: u64| if seconds > 0.0 { count as f64 / seconds } else { 0.0 };

        let sample = RateSample {
            decoded_fps: rate(self.received),
            detected_fps: rate(self.processed),
            elapsed,
        };

        self.received = 0;
        self.processed = 0;
        self.started = now;
        sample
    }
}

/// Latest published metrics for one track.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrackMetrics {
    pub fps_decoding: f64,
    pub fps_detection: f64,
    pub detection_time: Option<Duration>,
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_sent_to_inference: u64,
    pub inference_failures: u64,
}

/// Shared handle a track writes its metrics through.
#[derive(Clone, Debug, Default)]
pub struct MetricsHandle {
    inner: Arc<Mutex<TrackMetrics>>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> TrackMetrics {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut TrackMetrics)) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

/// Per-track metrics, keyed by track name in registration order.
#[derive(Clone, Debug, Default)]
pub struct StatsBoard {
    tracks: Arc<Mutex<Vec<(String, MetricsHandle)>>>,
}

impl StatsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `track`, creating it on first use.
    pub fn register(&self, track: &str) -> MetricsHandle {
        let mut tracks = match self.tracks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((_, handle)) = tracks.iter().find(|(name, _)| name == track) {
            return handle.clone();
        }
        let handle = MetricsHandle::default();
        tracks.push((track.to_string(), handle.clone()));
        handle
    }

    pub fn remove(&self, track: &str) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.retain(|(name, _)| name != track);
        }
    }

    pub fn track_names(&self) -> Vec<String> {
        match self.tracks.lock() {
            Ok(tracks) => tracks.iter().map(|(name, _)| name.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Metrics for the first subscribed track on the board, else the first
    /// registered track, else zeros.
    pub fn metrics_for(&self, subscriptions: &[String]) -> TrackMetrics {
        let tracks = match self.tracks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscriptions
            .iter()
            .find_map(|wanted| tracks.iter().find(|(name, _)| name == wanted))
            .or_else(|| tracks.first())
            .map(|(_, handle)| handle.snapshot())
            .unwrap_or_default()
    }
}
