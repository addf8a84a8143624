use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::message::{now_millis, RttProbe, TelemetryMessage, TelemetryStats};

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Ordered, reliable message channel to one peer.
pub trait SideChannel: Send + Sync {
    /// Deliver one text record.
    fn send(&self, payload: String) -> SendFuture<'_>;

    /// False once the peer is gone; such connections are pruned.
    fn is_open(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Producer,
    Consumer,
}

/// One peer session and its side-channel.
pub struct Connection {
    id: String,
    role: ConnectionRole,
    subscriptions: Vec<String>,
    rtt_ms: Mutex<Option<u64>>,
    channel: Arc<dyn SideChannel>,
}

impl Connection {
    pub fn new(role: ConnectionRole, channel: Arc<dyn SideChannel>) -> Self {
        Self::with_id(generate_id(), role, channel)
    }

    pub fn with_id(id: impl Into<String>, role: ConnectionRole, channel: Arc<dyn SideChannel>) -> Self {
        Self {
            id: id.into(),
            role,
            subscriptions: Vec::new(),
            rtt_ms: Mutex::new(None),
            channel,
        }
    }

    /// Subscribe to a track by name; the first subscription drives telemetry.
    pub fn subscribe(mut self, track: impl Into<String>) -> Self {
        self.subscriptions.push(track.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Latest measured round trip in milliseconds.
    pub fn rtt_ms(&self) -> Option<u64> {
        match self.rtt_ms.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_rtt_ms(&self, rtt: u64) {
        let mut guard = match self.rtt_ms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(rtt);
    }

    async fn send_message(&self, message: TelemetryMessage) -> Result<()> {
        let payload = serde_json::to_string(&message).context("failed to encode telemetry message")?;
        self.channel
            .send(payload)
            .await
            .with_context(|| format!("send to connection {} failed", self.id))
    }

    /// Send a probe stamped with the current wall-clock time.
    pub async fn send_rtt_probe(&self) -> Result<()> {
        self.send_message(TelemetryMessage::RttProbe(RttProbe {
            timestamp: now_millis(),
            connection_id: Some(self.id.clone()),
        }))
        .await
    }

    pub async fn send_statistics(&self, mut stats: TelemetryStats) -> Result<()> {
        stats.connection_id = Some(self.id.clone());
        self.send_message(TelemetryMessage::Telemetry(stats)).await
    }

    /// Handle an inbound record. An echoed probe updates the round trip.
    pub fn handle_message(&self, text: &str) -> Result<()> {
        let message: TelemetryMessage =
            serde_json::from_str(text).map_err(|e| anyhow!("invalid side-channel message: {}", e))?;
        match message {
            TelemetryMessage::RttProbe(probe) | TelemetryMessage::RttResult(probe) => {
                let rtt = now_millis().saturating_sub(probe.timestamp);
                self.set_rtt_ms(rtt);
                debug!("connection {}: rtt {} ms", self.id, rtt);
            }
            TelemetryMessage::Telemetry(_) => {}
        }
        Ok(())
    }
}

/// Random 128-bit hex id.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Side-channel backed by an in-process queue, drained by a transport writer.
pub struct QueuedChannel {
    tx: mpsc::Sender<String>,
}

impl QueuedChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SideChannel for QueuedChannel {
    fn send(&self, payload: String) -> SendFuture<'_> {
        Box::pin(async move {
            self.tx
                .send(payload)
                .await
                .map_err(|_| anyhow!("side-channel closed"))
        })
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoed_probe_sets_rtt() -> Result<()> {
        let (channel, mut rx) = QueuedChannel::new(4);
        let connection = Connection::new(ConnectionRole::Consumer, Arc::new(channel));
        assert_eq!(connection.rtt_ms(), None);

        connection.send_rtt_probe().await?;
        let probe = rx.recv().await.ok_or_else(|| anyhow!("no probe"))?;
        assert!(probe.contains(connection.id()));

        connection.handle_message(&probe)?;
        assert!(connection.rtt_ms().is_some_and(|rtt| rtt < 1_000));
        Ok(())
    }

    #[test]
    fn stale_timestamps_measure_elapsed_time() -> Result<()> {
        let (channel, _rx) = QueuedChannel::new(1);
        let connection = Connection::new(ConnectionRole::Producer, Arc::new(channel));
        let sent = now_millis() - 250;
        connection.handle_message(&format!(r#"{{"type":"rtt-result","timestamp":{}}}"#, sent))?;
        assert!(connection.rtt_ms().is_some_and(|rtt| (250..1_250).contains(&rtt)));
        Ok(())
    }

    #[test]
    fn closed_queue_marks_connection_closed() {
        let (channel, rx) = QueuedChannel::new(1);
        let connection = Connection::new(ConnectionRole::Consumer, Arc::new(channel));
        assert!(connection.is_open());
        drop(rx);
        assert!(!connection.is_open());
    }

    #[test]
    fn ids_are_unique_hex() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
