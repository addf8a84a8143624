use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{info, warn};

use crate::models::ModelRecord;

use super::backend::DetectorBackend;

/// Detector backends keyed by model id.
///
/// Backends are shared read-only across tracks, so they are held as
/// `Arc<dyn DetectorBackend>` without a lock.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn DetectorBackend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend under its name. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        self.register_shared(Arc::new(backend));
    }

    pub fn register_shared(&mut self, backend: Arc<dyn DetectorBackend>) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, backend);
    }

    /// Build and register a backend for every loadable model record.
    ///
    /// Records that fail to load are logged and skipped. Returns the number loaded.
    pub fn load_records(&mut self, records: &[ModelRecord], max_detections: Option<usize>) -> usize {
        let mut loaded = 0;
        for record in records {
            let built = record.build_backend(max_detections).and_then(|backend| {
                backend.warm_up()?;
                Ok(backend)
            });
            match built {
                Ok(backend) => {
                    info!("loaded {} model '{}' from {}", record.kind, record.id, record.path.display());
                    self.register_shared(backend);
                    loaded += 1;
                }
                Err(err) => warn!("skipping model '{}': {:#}", record.id, err),
            }
        }
        loaded
    }

    /// Get backend by model id.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DetectorBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<dyn DetectorBackend>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Resolve a model id, falling back to the default when none is given.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn DetectorBackend>> {
        match name {
            Some(name) => self.get(name).ok_or_else(|| {
                anyhow!(
                    "model '{}' is not loaded (available: {})",
                    name,
                    self.list().join(", ")
                )
            }),
            None => self
                .default_backend()
                .ok_or_else(|| anyhow!("no detector backends registered")),
        }
    }

    /// Registered model ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
