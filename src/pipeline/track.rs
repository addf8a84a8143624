use std::time::Duration;

use log::info;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::scheduler::{FrameScheduler, SchedulerCounters};
use crate::frame::SharedFrame;
use crate::ingest::FrameStream;

/// Frames buffered per downstream subscriber before it starts lagging.
const OUTPUT_CAPACITY: usize = 4;

/// A subscribed video stream driven through a `FrameScheduler`.
///
/// Owns the source stream, the scheduler and the rate window timer. Every
/// arriving frame yields exactly one output frame on the broadcast channel.
pub struct InstrumentedTrack {
    stream: FrameStream,
    scheduler: FrameScheduler,
    output: broadcast::Sender<SharedFrame>,
    rate_window: Duration,
}

impl InstrumentedTrack {
    pub fn new(stream: FrameStream, scheduler: FrameScheduler, rate_window: Duration) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            stream,
            scheduler,
            output,
            rate_window,
        }
    }

    pub fn name(&self) -> &str {
        self.scheduler.track()
    }

    /// Receive the republished frames.
    pub fn subscribe(&self) -> broadcast::Receiver<SharedFrame> {
        self.output.subscribe()
    }

    /// Drive the track until the source ends or `shutdown` flips to true.
    ///
    /// On exit the in-flight job is cancelled and the rate timer stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerCounters {
        let mut rates = time::interval_at(Instant::now() + self.rate_window, self.rate_window);
        rates.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                frame = self.stream.next() => match frame {
                    Some(frame) => {
                        let out = self.scheduler.on_frame_arrived(frame);
                        let _ = self.output.send(out);
                    }
                    None => break,
                },
                _ = self.scheduler.next_completion() => {}
                _ = rates.tick() => {
                    self.scheduler.report_rates(Instant::now());
                }
            }
        }

        self.scheduler.cancel();
        let counters = self.scheduler.counters();
        info!(
            "{}: track ended ({} received, {} sent to inference, {} processed, {} failed)",
            self.scheduler.track(),
            counters.received,
            counters.sent_to_inference,
            counters.processed,
            counters.failed
        );
        counters
    }
}
