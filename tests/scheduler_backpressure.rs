use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use vision_relay::detect::{BackendRegistry, StubBackend};
use vision_relay::frame::Frame;
use vision_relay::ingest::{FrameStream, MediaSource, SourceConfig, VideoSource};
use vision_relay::pipeline::{
    Completion, FrameScheduler, FrameTransform, InstrumentedTrack, MetricsHandle, TrackPhase, TransformKind,
    TransformOptions, TransformStrategy, WorkerPool,
};

/// Blocks every job until the test opens the gate, then paints the frame white.
struct GatedTransform {
    gate: Mutex<mpsc::Receiver<()>>,
    jobs: AtomicUsize,
}

impl FrameTransform for GatedTransform {
    fn transform(&self, frame: &Frame) -> Result<Frame> {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().map_err(|_| anyhow!("gate poisoned"))?;
        gate.recv().map_err(|_| anyhow!("gate closed"))?;
        Ok(frame.with_image(RgbImage::from_pixel(frame.width(), frame.height(), Rgb([255, 255, 255]))))
    }
}

fn frame(sequence: u64) -> Frame {
    Frame::new(RgbImage::new(4, 4), sequence, Duration::from_millis(sequence * 40))
}

#[tokio::test]
async fn frames_during_inference_reuse_published_frame() {
    let (open, gate) = mpsc::channel();
    let transform = Arc::new(GatedTransform {
        gate: Mutex::new(gate),
        jobs: AtomicUsize::new(0),
    });
    let metrics = MetricsHandle::default();
    let mut scheduler = FrameScheduler::new("cam", transform.clone(), WorkerPool::new(2), metrics.clone());

    // Idle: one job starts and the first frame is published untouched.
    let first = scheduler.on_frame_arrived(frame(0));
    assert_eq!(first.sequence, 0);
    assert_eq!(scheduler.phase(), TrackPhase::Processing);
    assert_eq!(scheduler.counters().sent_to_inference, 1);

    // Processing: same Arc back, no new job.
    for sequence in 1..5 {
        let out = scheduler.on_frame_arrived(frame(sequence));
        assert!(Arc::ptr_eq(&out, &first));
    }
    assert_eq!(scheduler.counters().received, 5);
    assert_eq!(scheduler.counters().sent_to_inference, 1);

    open.send(()).unwrap();
    assert_eq!(scheduler.next_completion().await, Completion::Published { sequence: 0 });
    assert_eq!(scheduler.phase(), TrackPhase::Idle);

    let published = scheduler.published().cloned().unwrap();
    assert_eq!(published.sequence, 0);
    assert_eq!(published.pts, Duration::ZERO);
    assert_eq!(published.image().get_pixel(0, 0), &Rgb([255, 255, 255]));
    assert!(scheduler.last_latency().is_some());

    // Next arrival gets the processed frame and starts a fresh job.
    let out = scheduler.on_frame_arrived(frame(5));
    assert!(Arc::ptr_eq(&out, &published));
    assert_eq!(scheduler.counters().sent_to_inference, 2);
    assert!(transform.jobs.load(Ordering::SeqCst) <= 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.frames_received, 6);
    assert_eq!(snapshot.frames_processed, 1);

    scheduler.cancel();
    drop(open);
}

#[tokio::test]
async fn synthetic_track_runs_until_shutdown() {
    let mut backends = BackendRegistry::new();
    backends.register(StubBackend::new());
    let options = TransformOptions {
        model_id: Some(StubBackend::NAME.to_string()),
        confidence_threshold: Some(0.5),
        delay: Duration::ZERO,
        ..TransformOptions::default()
    };
    let transform = TransformStrategy::resolve(TransformKind::Detect, &backends, &options).unwrap();

    let mut source = VideoSource::new(SourceConfig {
        url: "stub://test".into(),
        target_fps: 100,
        width: 64,
        height: 48,
    })
    .unwrap();
    source.connect().unwrap();
    let stream = source.subscribe().unwrap();

    let scheduler = FrameScheduler::new("test", Arc::new(transform), WorkerPool::new(1), MetricsHandle::default());
    let track = InstrumentedTrack::new(stream, scheduler, Duration::from_millis(100));
    let mut output = track.subscribe();

    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(track.run(shutdown));

    let republished = output.recv().await.unwrap();
    assert_eq!(republished.width(), 64);

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.send(true).unwrap();
    let counters = running.await.unwrap();

    assert!(counters.received > 0);
    assert!(counters.processed > 0);
    assert!(counters.sent_to_inference <= counters.received);
    assert!(counters.sent_to_inference <= counters.processed + counters.failed + 1);
}

#[tokio::test]
async fn source_ending_mid_inference_cancels_the_job() {
    let (open, gate) = mpsc::channel();
    let transform = Arc::new(GatedTransform {
        gate: Mutex::new(gate),
        jobs: AtomicUsize::new(0),
    });
    let metrics = MetricsHandle::default();
    let scheduler = FrameScheduler::new("cam", transform.clone(), WorkerPool::new(1), metrics.clone());

    let (frames, rx) = tokio::sync::mpsc::channel(4);
    let track = InstrumentedTrack::new(FrameStream::new(rx), scheduler, Duration::from_secs(1));
    let mut output = track.subscribe();
    let (_stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(track.run(shutdown));

    frames.send(frame(0)).await.unwrap();
    assert_eq!(output.recv().await.unwrap().sequence, 0);
    while transform.jobs.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Source ends while the job is still blocked on the gate.
    drop(frames);
    let counters = running.await.unwrap();
    assert_eq!(counters.received, 1);
    assert_eq!(counters.sent_to_inference, 1);
    assert_eq!(counters.processed, 0);

    // The job finishes after the track is gone; nothing is published.
    open.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(metrics.snapshot().frames_processed, 0);
    assert!(matches!(output.recv().await, Err(RecvError::Closed)));
}
