//! Side-channel wire format.
//!
//! Every record is a JSON object whose `type` field selects the variant:
//!
//! ```json
//! {"type": "rtt-probe", "timestamp": 1718000000123, "connectionId": "9f2c..."}
//! {"type": "telemetry", "rtt": 42, "fpsDecoding": 14.9, "fpsDetection": 3.1, "detectionTimeMs": 310, ...}
//! ```
//!
//! Peers echo probes back unchanged (or as `rtt-result`); the echoed
//! `timestamp` gives the round trip.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::pipeline::TrackMetrics;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TelemetryMessage {
    RttProbe(RttProbe),
    RttResult(RttProbe),
    Telemetry(TelemetryStats),
}

/// Timestamped probe, echoed by the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RttProbe {
    /// Milliseconds since the Unix epoch when the probe was sent.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// Per-tick statistics pushed to each connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    /// This connection's latest round trip in milliseconds.
    pub rtt: Option<u64>,
    /// Same as `rtt`; kept for consumers that distinguish both ends.
    pub rtt_consumer: Option<u64>,
    /// Round trip of the primary producer connection.
    pub rtt_producer: Option<u64>,
    pub fps_decoding: f64,
    pub fps_detection: f64,
    pub detection_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl TelemetryStats {
    pub fn new(metrics: &TrackMetrics, rtt: Option<u64>, rtt_producer: Option<u64>) -> Self {
        Self {
            rtt,
            rtt_consumer: rtt,
            rtt_producer,
            fps_decoding: metrics.fps_decoding,
            fps_detection: metrics.fps_detection,
            detection_time_ms: metrics.detection_time.map(|d| d.as_millis() as u64),
            connection_id: None,
        }
    }
}

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
