use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use vision_relay::config::TelemetrySettings;
use vision_relay::pipeline::StatsBoard;
use vision_relay::telemetry::{ConnectionRegistry, TelemetryBroadcaster};
use vision_relay::transport::{TelemetryListener, MAX_LINE_BYTES};

async fn wait_for(registry: &ConnectionRegistry, expected: usize) {
    for _ in 0..200 {
        if registry.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never reached {} connections (has {})", expected, registry.len());
}

#[tokio::test]
async fn peer_receives_telemetry_and_reports_rtt() {
    let registry = ConnectionRegistry::new();
    let listener = TelemetryListener::bind("127.0.0.1:0", registry.clone(), vec!["camera".into()])
        .await
        .expect("bind");

    let stream = TcpStream::connect(listener.local_addr()).await.expect("connect");
    wait_for(&registry, 1).await;
    let connection = registry.all().pop().expect("registered connection");
    assert_eq!(connection.subscriptions(), ["camera"]);

    let mut broadcaster = TelemetryBroadcaster::new(registry.clone(), StatsBoard::new(), &TelemetrySettings::default());
    let report = broadcaster.tick().await;
    assert_eq!(report.delivered, 2);

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut rtt_record = None;
    for _ in 0..2 {
        let line = lines.next_line().await.expect("read").expect("line");
        let value: Value = serde_json::from_str(&line).expect("json");
        match value["type"].as_str() {
            Some("rtt-probe") => rtt_record = Some(line),
            Some("telemetry") => assert_eq!(value["connectionId"], connection.id()),
            other => panic!("unexpected record type {:?}", other),
        }
    }

    let rtt_record = rtt_record.expect("rtt line");
    write_half.write_all(rtt_record.as_bytes()).await.expect("echo");
    write_half.write_all(b"\n").await.expect("newline");
    for _ in 0..200 {
        if connection.rtt_ms().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connection.rtt_ms().is_some());

    drop(write_half);
    drop(lines);
    wait_for(&registry, 0).await;
}

#[tokio::test]
async fn endless_line_drops_the_peer() {
    let registry = ConnectionRegistry::new();
    let listener = TelemetryListener::bind("127.0.0.1:0", registry.clone(), vec!["camera".into()])
        .await
        .expect("bind");

    let mut stream = TcpStream::connect(listener.local_addr()).await.expect("connect");
    wait_for(&registry, 1).await;

    let flood = vec![b'x'; MAX_LINE_BYTES + 512];
    stream.write_all(&flood).await.expect("write");
    wait_for(&registry, 0).await;
}

#[tokio::test]
async fn line_at_the_limit_keeps_the_peer() {
    let registry = ConnectionRegistry::new();
    let listener = TelemetryListener::bind("127.0.0.1:0", registry.clone(), vec!["camera".into()])
        .await
        .expect("bind");

    let mut stream = TcpStream::connect(listener.local_addr()).await.expect("connect");
    wait_for(&registry, 1).await;

    let mut line = vec![b' '; MAX_LINE_BYTES];
    line.push(b'\n');
    stream.write_all(&line).await.expect("write");
    stream.write_all(b"{}\n").await.expect("write");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.len(), 1);
}
