//! Model registry file.
//!
//! An ordered list of `{id, name, type, path}` records, stored either as a
//! JSON array or as TOML `[[models]]` tables. Entries that fail to parse or
//! validate are skipped with a warning so one bad record never takes the
//! relay down; an unreadable file or a top-level shape error is fatal.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use regex::Regex;
use serde::Deserialize;

use crate::detect::{AnchorSet, DetectorBackend};

const DEFAULT_INPUT_SIZE: [u32; 2] = [640, 640];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Anchor-free `[batch, 4 + C, N]` head with NMS.
    Yolo,
    /// Anchor-head segmentation-style network decoded per cell.
    Unet,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Yolo => write!(f, "yolo"),
            ModelKind::Unet => write!(f, "unet"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub path: PathBuf,
    /// Anchor priors per scale as `[width, height]`; required for `unet`.
    #[serde(default)]
    pub anchors: Option<Vec<Vec<[f32; 2]>>>,
    /// Class names indexed by label id.
    #[serde(default)]
    pub names: Vec<String>,
    /// Model input as `[width, height]`.
    #[serde(default)]
    pub input_size: Option<[u32; 2]>,
}

impl ModelRecord {
    pub fn input_size(&self) -> (u32, u32) {
        let [w, h] = self.input_size.unwrap_or(DEFAULT_INPUT_SIZE);
        (w, h)
    }

    pub fn anchor_set(&self) -> Result<AnchorSet> {
        let anchors = self
            .anchors
            .as_ref()
            .ok_or_else(|| anyhow!("model '{}' of type unet needs anchors", self.id))?;
        let scales = anchors
            .iter()
            .map(|scale| scale.iter().map(|[w, h]| (*w, *h)).collect())
            .collect();
        Ok(AnchorSet::new(scales)?)
    }

    pub fn label_names(&self) -> BTreeMap<usize, String> {
        self.names.iter().cloned().enumerate().collect()
    }

    fn validate(&self, id_pattern: &Regex) -> Result<()> {
        if !id_pattern.is_match(&self.id) {
            bail!("model id '{}' must be lowercase alphanumerics, '-' or '_'", self.id);
        }
        if self.name.trim().is_empty() {
            bail!("model '{}' has an empty name", self.id);
        }
        if self.path.as_os_str().is_empty() {
            bail!("model '{}' has an empty path", self.id);
        }
        if let Some([w, h]) = self.input_size {
            if w == 0 || h == 0 {
                bail!("model '{}' input size must be non-zero", self.id);
            }
        }
        if self.kind == ModelKind::Unet {
            self.anchor_set()?;
        }
        Ok(())
    }

    /// Load the model weights and wrap them in the matching backend.
    #[cfg(feature = "backend-tract")]
    pub fn build_backend(&self, max_detections: Option<usize>) -> Result<Arc<dyn DetectorBackend>> {
        use crate::detect::{AnchorHeadBackend, DetectionDecoder, TractModel, YoloBackend};

        let (width, height) = self.input_size();
        let model = Box::new(TractModel::load(&self.path, width, height)?);
        let backend: Arc<dyn DetectorBackend> = match self.kind {
            ModelKind::Yolo => Arc::new(YoloBackend::new(&self.id, model).with_names(self.label_names())),
            ModelKind::Unet => Arc::new(
                AnchorHeadBackend::new(&self.id, model, DetectionDecoder::new(self.anchor_set()?))
                    .with_max_detections(max_detections)
                    .with_names(self.label_names()),
            ),
        };
        Ok(backend)
    }

    #[cfg(not(feature = "backend-tract"))]
    pub fn build_backend(&self, _max_detections: Option<usize>) -> Result<Arc<dyn DetectorBackend>> {
        bail!(
            "loading {} from {} requires the backend-tract feature",
            self.id,
            self.path.display()
        )
    }
}

/// Registry file encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryFormat {
    Json,
    Toml,
}

impl RegistryFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => RegistryFormat::Toml,
            _ => RegistryFormat::Json,
        }
    }
}

pub fn load_registry(path: &Path) -> Result<Vec<ModelRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model registry {}", path.display()))?;
    parse_registry(&raw, RegistryFormat::from_path(path))
        .with_context(|| format!("invalid model registry {}", path.display()))
}

/// Parse registry text, keeping valid records in file order.
pub fn parse_registry(raw: &str, format: RegistryFormat) -> Result<Vec<ModelRecord>> {
    let entries: Vec<Result<ModelRecord>> = match format {
        RegistryFormat::Json => {
            let values: Vec<serde_json::Value> =
                serde_json::from_str(raw).map_err(|e| anyhow!("expected a JSON array of models: {}", e))?;
            values
                .into_iter()
                .map(|value| serde_json::from_value(value).map_err(anyhow::Error::from))
                .collect()
        }
        RegistryFormat::Toml => {
            let mut table: toml::Table = toml::from_str(raw)?;
            let models = match table.remove("models") {
                Some(toml::Value::Array(models)) => models,
                Some(_) => bail!("`models` must be an array of tables"),
                None => Vec::new(),
            };
            models
                .into_iter()
                .map(|value| -> Result<ModelRecord> { Ok(value.try_into()?) })
                .collect()
        }
    };

    let id_pattern = Regex::new(r"^[a-z0-9][a-z0-9_-]*$")?;
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let record = match entry.and_then(|record| record.validate(&id_pattern).map(|_| record)) {
            Ok(record) => record,
            Err(err) => {
                warn!("skipping model registry entry {}: {:#}", index, err);
                continue;
            }
        };
        if !seen.insert(record.id.clone()) {
            warn!("skipping model registry entry {}: duplicate id '{}'", index, record.id);
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_lowercase_names() -> Result<()> {
        let records = parse_registry(
            r#"[{"id": "airplane-damage", "name": "Airplane damage", "type": "yolo", "path": "weights/damage.onnx"}]"#,
            RegistryFormat::Json,
        )?;
        assert_eq!(records[0].kind, ModelKind::Yolo);
        assert_eq!(records[0].input_size(), (640, 640));
        Ok(())
    }

    #[test]
    fn unet_without_anchors_is_skipped() -> Result<()> {
        let records = parse_registry(
            r#"[{"id": "fence-detection", "name": "Fence", "type": "unet", "path": "fence.onnx"}]"#,
            RegistryFormat::Json,
        )?;
        assert!(records.is_empty());
        Ok(())
    }

    #[test]
    fn non_array_json_is_fatal() {
        assert!(parse_registry(r#"{"id": "x"}"#, RegistryFormat::Json).is_err());
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn building_without_runtime_reports_feature() -> Result<()> {
        let records = parse_registry(
            r#"[{"id": "airplane-damage", "name": "Airplane damage", "type": "yolo", "path": "damage.onnx"}]"#,
            RegistryFormat::Json,
        )?;
        let err = records[0].build_backend(None).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("backend-tract"));
        Ok(())
    }
}
