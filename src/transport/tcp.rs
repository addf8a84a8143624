//! Newline-delimited JSON telemetry over TCP.
//!
//! Each accepted socket becomes a consumer `Connection` in the registry.
//! Outbound records are queued and written by a per-socket writer task;
//! inbound lines (probe echoes) go to `Connection::handle_message`. The
//! connection is unregistered as soon as the peer closes its end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};

use crate::telemetry::{Connection, ConnectionRegistry, ConnectionRole, QueuedChannel};

/// Records queued per socket before sends start to wait.
const OUTBOX_CAPACITY: usize = 32;
/// Longest inbound line, newline excluded. Longer lines drop the peer.
pub const MAX_LINE_BYTES: usize = 8192;

pub struct TelemetryListener {
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl TelemetryListener {
    /// Bind and start accepting. New connections subscribe to `tracks`.
    pub async fn bind(addr: impl ToSocketAddrs, connections: ConnectionRegistry, tracks: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("failed to bind telemetry listener")?;
        let local_addr = listener.local_addr()?;
        if !is_loopback_addr(&local_addr) {
            warn!("telemetry listener on non-loopback address {} has no authentication", local_addr);
        }
        info!("telemetry listening on {}", local_addr);

        let accept_task = tokio::spawn(async move {
            let mut sessions = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            sessions.spawn(serve(stream, peer, connections.clone(), tracks.clone()));
                        }
                        Err(e) => {
                            warn!("telemetry accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                }
            }
        });

        Ok(Self { accept_task, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TelemetryListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, connections: ConnectionRegistry, tracks: Vec<String>) {
    let (read_half, mut write_half) = stream.into_split();
    let (channel, mut outbox) = QueuedChannel::new(OUTBOX_CAPACITY);

    let connection = tracks
        .into_iter()
        .fold(Connection::new(ConnectionRole::Consumer, Arc::new(channel)), Connection::subscribe);
    let connection = Arc::new(connection);
    if let Err(err) = connections.register(Arc::clone(&connection)) {
        warn!("rejecting telemetry peer {}: {:#}", peer, err);
        return;
    }
    debug!("telemetry peer {} is connection {}", peer, connection.id());

    let writer = tokio::spawn(async move {
        while let Some(record) = outbox.recv().await {
            let written = async {
                write_half.write_all(record.as_bytes()).await?;
                write_half.write_all(b"\n").await
            };
            if let Err(e) = written.await {
                debug!("telemetry write to {} failed: {}", peer, e);
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_BYTES => {
                warn!("dropping telemetry peer {}: line exceeds {} bytes", peer, MAX_LINE_BYTES);
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(err) = connection.handle_message(line) {
                    debug!("connection {}: {:#}", connection.id(), err);
                }
            }
            Err(e) => {
                warn!("telemetry read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    connections.unregister(connection.id());
    writer.abort();
}

/// True for loopback IPs.
pub fn is_loopback_addr(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}
