use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::SourceConfig;
use crate::pipeline::TransformKind;

const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_SOURCE_FPS: u32 = 15;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_TRACK_NAME: &str = "camera";
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_RATE_WINDOW_MS: u64 = 1_000;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DELAY_MS: u64 = 1_000;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_TELEMETRY_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_HOUSEKEEPING_TICKS: u64 = 10;
const DEFAULT_MAX_PRODUCERS: usize = 1;

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    model_registry: Option<PathBuf>,
    source: Option<SourceConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    track_name: Option<String>,
    transform: Option<String>,
    model_id: Option<String>,
    confidence_threshold: Option<f32>,
    max_detections: Option<usize>,
    workers: Option<usize>,
    rate_window_ms: Option<u64>,
    inference_timeout_ms: Option<u64>,
    delay_ms: Option<u64>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    addr: Option<String>,
    interval_ms: Option<u64>,
    housekeeping_ticks: Option<u64>,
    max_producers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub model_registry: Option<PathBuf>,
    pub source: SourceConfig,
    pub pipeline: PipelineSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub track_name: String,
    pub transform: TransformKind,
    pub model_id: Option<String>,
    pub confidence_threshold: f32,
    pub max_detections: Option<usize>,
    pub workers: usize,
    pub rate_window: Duration,
    pub inference_timeout: Duration,
    /// Sleep used by the `delay` transform.
    pub delay: Duration,
    /// Font for detection labels and the rate caption.
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub addr: String,
    pub interval: Duration,
    /// Run housekeeping every this many ticks.
    pub housekeeping_ticks: u64,
    pub max_producers: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_TELEMETRY_ADDR.to_string(),
            interval: Duration::from_millis(DEFAULT_TELEMETRY_INTERVAL_MS),
            housekeeping_ticks: DEFAULT_HOUSEKEEPING_TICKS,
            max_producers: DEFAULT_MAX_PRODUCERS,
        }
    }
}

impl RelayConfig {
    /// Defaults, then the file named by `RELAY_CONFIG`, then `RELAY_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = env_value("RELAY_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file instead of `RELAY_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let telemetry = file.telemetry.unwrap_or_default();

        let transform = match pipeline.transform.as_deref() {
            Some(name) => name.parse()?,
            None => TransformKind::PassThrough,
        };

        Ok(Self {
            model_registry: file.model_registry,
            source: SourceConfig {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            },
            pipeline: PipelineSettings {
                track_name: pipeline.track_name.unwrap_or_else(|| DEFAULT_TRACK_NAME.to_string()),
                transform,
                model_id: pipeline.model_id,
                confidence_threshold: pipeline.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
                max_detections: pipeline.max_detections,
                workers: pipeline.workers.unwrap_or(DEFAULT_WORKERS),
                rate_window: Duration::from_millis(pipeline.rate_window_ms.unwrap_or(DEFAULT_RATE_WINDOW_MS)),
                inference_timeout: Duration::from_millis(
                    pipeline.inference_timeout_ms.unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS),
                ),
                delay: Duration::from_millis(pipeline.delay_ms.unwrap_or(DEFAULT_DELAY_MS)),
                font_path: pipeline.font_path,
            },
            telemetry: TelemetrySettings {
                addr: telemetry.addr.unwrap_or_else(|| DEFAULT_TELEMETRY_ADDR.to_string()),
                interval: Duration::from_millis(telemetry.interval_ms.unwrap_or(DEFAULT_TELEMETRY_INTERVAL_MS)),
                housekeeping_ticks: telemetry.housekeeping_ticks.unwrap_or(DEFAULT_HOUSEKEEPING_TICKS),
                max_producers: telemetry.max_producers.unwrap_or(DEFAULT_MAX_PRODUCERS),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("RELAY_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(transform) = env_value("RELAY_TRANSFORM") {
            self.pipeline.transform = transform.parse()?;
        }
        if let Some(model_id) = env_value("RELAY_MODEL_ID") {
            self.pipeline.model_id = Some(model_id);
        }
        if let Some(path) = env_value("RELAY_MODEL_REGISTRY") {
            self.model_registry = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("RELAY_FONT") {
            self.pipeline.font_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = env_value("RELAY_TELEMETRY_ADDR") {
            self.telemetry.addr = addr;
        }
        if let Some(workers) = env_value("RELAY_WORKERS") {
            self.pipeline.workers = workers
                .parse()
                .map_err(|_| anyhow!("RELAY_WORKERS must be a positive integer"))?;
        }
        if let Some(confidence) = env_value("RELAY_CONFIDENCE") {
            self.pipeline.confidence_threshold = confidence
                .parse()
                .map_err(|_| anyhow!("RELAY_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Some(max) = env_value("RELAY_MAX_DETECTIONS") {
            self.pipeline.max_detections = Some(
                max.parse()
                    .map_err(|_| anyhow!("RELAY_MAX_DETECTIONS must be a non-negative integer"))?,
            );
        }
        Ok(())
    }

    /// Re-run validation after callers override fields (e.g. from CLI flags).
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(anyhow!("worker pool size must be greater than zero"));
        }
        if self.pipeline.rate_window.is_zero() {
            return Err(anyhow!("rate window must be greater than zero"));
        }
        if self.pipeline.inference_timeout.is_zero() {
            return Err(anyhow!("inference timeout must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                self.pipeline.confidence_threshold
            ));
        }
        if self.pipeline.transform == TransformKind::Detect && self.pipeline.model_id.is_none() {
            return Err(anyhow!("the detect transform requires a model id"));
        }
        if self.pipeline.track_name.trim().is_empty() {
            return Err(anyhow!("track name must not be empty"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source target_fps must be greater than zero"));
        }
        if self.telemetry.interval.is_zero() {
            return Err(anyhow!("telemetry interval must be greater than zero"));
        }
        if self.telemetry.housekeeping_ticks == 0 {
            return Err(anyhow!("housekeeping_ticks must be greater than zero"));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
