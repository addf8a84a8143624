//! Fixed-cadence telemetry fan-out.
//!
//! Once per tick, every registered connection gets an RTT probe and a
//! statistics record, all sent concurrently. The tick waits for the whole
//! batch before sleeping; one connection failing or stalling never affects
//! the others. Every few ticks, closed connections are pruned.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{info, warn};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::Connection;
use super::message::TelemetryStats;
use super::registry::ConnectionRegistry;
use crate::config::TelemetrySettings;
use crate::pipeline::StatsBoard;

/// Outcome of one broadcast tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub connections: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pruned: Option<usize>,
}

pub struct TelemetryBroadcaster {
    connections: ConnectionRegistry,
    board: StatsBoard,
    interval: Duration,
    send_timeout: Duration,
    housekeeping_ticks: u64,
    ticks: u64,
}

#[derive(Clone, Copy, Debug)]
enum SendKind {
    Probe,
    Statistics,
}

impl TelemetryBroadcaster {
    pub fn new(connections: ConnectionRegistry, board: StatsBoard, settings: &TelemetrySettings) -> Self {
        Self {
            connections,
            board,
            interval: settings.interval,
            send_timeout: settings.interval,
            housekeeping_ticks: settings.housekeeping_ticks.max(1),
            ticks: 0,
        }
    }

    /// Upper bound on a single send before it counts as failed.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Run one broadcast cycle and wait for every send to settle.
    pub async fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let connections = self.connections.all();
        let rtt_producer = self.connections.primary_producer().and_then(|p| p.rtt_ms());

        let mut sends = JoinSet::new();
        for connection in &connections {
            let metrics = self.board.metrics_for(connection.subscriptions());
            let stats = TelemetryStats::new(&metrics, connection.rtt_ms(), rtt_producer);

            let probe = Arc::clone(connection);
            let timeout = self.send_timeout;
            sends.spawn(async move {
                let result = bounded(timeout, probe.send_rtt_probe()).await;
                (probe, SendKind::Probe, result)
            });

            let target = Arc::clone(connection);
            sends.spawn(async move {
                let result = bounded(timeout, target.send_statistics(stats)).await;
                (target, SendKind::Statistics, result)
            });
        }

        let mut report = TickReport {
            tick: self.ticks,
            connections: connections.len(),
            ..TickReport::default()
        };
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => report.delivered += 1,
                Ok((connection, kind, Err(err))) => {
                    report.failed += 1;
                    warn!("telemetry {:?} to connection {} failed: {:#}", kind, connection.id(), err);
                }
                Err(err) => {
                    report.failed += 1;
                    warn!("telemetry send task did not finish: {}", err);
                }
            }
        }

        if self.ticks % self.housekeeping_ticks == 0 {
            report.pruned = Some(self.housekeeping());
        }
        report
    }

    fn housekeeping(&self) -> usize {
        let pruned = self.connections.prune_closed();
        info!(
            "telemetry housekeeping: {} producers, {} consumers, {} closed connections pruned, tracks [{}]",
            self.connections.producer_count(),
            self.connections.consumer_count(),
            pruned,
            self.board.track_names().join(", ")
        );
        pruned
    }

    /// Tick forever at the configured cadence.
    pub async fn run(mut self) {
        loop {
            self.tick().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Start the loop as a task. Dropping or shutting down the handle aborts
    /// it along with any sends still in flight.
    pub fn spawn(self) -> BroadcasterHandle {
        BroadcasterHandle {
            task: tokio::spawn(self.run()),
        }
    }
}

async fn bounded(timeout: Duration, send: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    tokio::time::timeout(timeout, send)
        .await
        .map_err(|_| anyhow!("send timed out after {:?}", timeout))?
}

pub struct BroadcasterHandle {
    task: JoinHandle<()>,
}

impl BroadcasterHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for BroadcasterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ConnectionRole, QueuedChannel};

    #[tokio::test]
    async fn housekeeping_prunes_on_schedule() -> Result<()> {
        let registry = ConnectionRegistry::new();
        let (open, _open_rx) = QueuedChannel::new(8);
        let (closed, closed_rx) = QueuedChannel::new(8);
        drop(closed_rx);
        registry.register(Arc::new(Connection::new(ConnectionRole::Consumer, Arc::new(open))))?;
        registry.register(Arc::new(Connection::new(ConnectionRole::Consumer, Arc::new(closed))))?;

        let settings = TelemetrySettings {
            housekeeping_ticks: 2,
            ..TelemetrySettings::default()
        };
        let mut broadcaster = TelemetryBroadcaster::new(registry.clone(), StatsBoard::new(), &settings);

        let first = broadcaster.tick().await;
        assert_eq!((first.delivered, first.failed, first.pruned), (2, 2, None));

        let second = broadcaster.tick().await;
        assert_eq!(second.pruned, Some(1));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_sends_time_out() -> Result<()> {
        let registry = ConnectionRegistry::new();
        // capacity one and never drained: the second send of the tick stalls
        let (stalled, _rx) = QueuedChannel::new(1);
        registry.register(Arc::new(Connection::new(ConnectionRole::Consumer, Arc::new(stalled))))?;

        let mut broadcaster = TelemetryBroadcaster::new(registry, StatsBoard::new(), &TelemetrySettings::default())
            .with_send_timeout(Duration::from_millis(100));

        let report = broadcaster.tick().await;
        assert_eq!((report.delivered, report.failed), (1, 1));
        Ok(())
    }
}
