//! relayd - live video relay daemon
//!
//! This daemon:
//! 1. Loads the model registry and builds detector backends
//! 2. Relays one video track through the selected transform
//! 3. Serves telemetry to side-channel peers until Ctrl-C

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use vision_relay::config::RelayConfig;
use vision_relay::pipeline::TransformKind;
use vision_relay::relay;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay a video track through object detection with live telemetry"
)]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Source URL: stub://<name> or dir://<path>.
    #[arg(long)]
    source: Option<String>,

    /// Frame transform: passthrough, detect or delay.
    #[arg(long)]
    transform: Option<TransformKind>,

    /// Model id used by the detect transform.
    #[arg(long)]
    model_id: Option<String>,

    /// Model registry file.
    #[arg(long)]
    model_registry: Option<PathBuf>,

    /// Font file for detection labels and the rate caption.
    #[arg(long)]
    font: Option<PathBuf>,

    /// Telemetry listener address.
    /// Non-loopback addresses are accepted with a warning.
    #[arg(long)]
    telemetry_addr: Option<String>,

    /// Inference worker pool size.
    #[arg(long)]
    workers: Option<usize>,

    /// Minimum detection confidence in [0, 1].
    #[arg(long)]
    confidence: Option<f32>,
}

impl Args {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(url) = self.source {
            config.source.url = url;
        }
        if let Some(transform) = self.transform {
            config.pipeline.transform = transform;
        }
        if let Some(model_id) = self.model_id {
            config.pipeline.model_id = Some(model_id);
        }
        if let Some(path) = self.model_registry {
            config.model_registry = Some(path);
        }
        if let Some(path) = self.font {
            config.pipeline.font_path = Some(path);
        }
        if let Some(addr) = self.telemetry_addr {
            config.telemetry.addr = addr;
        }
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if let Some(confidence) = self.confidence {
            config.pipeline.confidence_threshold = confidence;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("relayd running (Ctrl-C to stop)");
    let counters = runtime.block_on(relay::run(config, shutdown_rx))?;
    log::info!(
        "relayd stopped: {} frames received, {} sent to inference, {} processed, {} failed",
        counters.received,
        counters.sent_to_inference,
        counters.processed,
        counters.failed
    );
    Ok(())
}
