use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use log::info;

use super::connection::{Connection, ConnectionRole};

const DEFAULT_MAX_PRODUCERS: usize = 1;

#[derive(Default)]
struct Inner {
    producers: Vec<Arc<Connection>>,
    consumers: Vec<Arc<Connection>>,
}

/// Live connections by role.
///
/// Cheap to clone; clones share the same set. The first registered producer
/// is the primary one whose round trip is reported to everyone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
    max_producers: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_max_producers(DEFAULT_MAX_PRODUCERS)
    }

    pub fn with_max_producers(max_producers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_producers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a connection. Fails when the producer limit is already reached.
    pub fn register(&self, connection: Arc<Connection>) -> Result<()> {
        let mut inner = self.lock();
        match connection.role() {
            ConnectionRole::Producer => {
                if inner.producers.len() >= self.max_producers {
                    bail!(
                        "producer limit reached ({} of {})",
                        inner.producers.len(),
                        self.max_producers
                    );
                }
                inner.producers.push(Arc::clone(&connection));
            }
            ConnectionRole::Consumer => inner.consumers.push(Arc::clone(&connection)),
        }
        info!(
            "registered {:?} connection {} ({} producers, {} consumers)",
            connection.role(),
            connection.id(),
            inner.producers.len(),
            inner.consumers.len()
        );
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<Connection>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let removed = [&mut inner.producers, &mut inner.consumers]
            .into_iter()
            .find_map(|list| list.iter().position(|c| c.id() == id).map(|index| list.remove(index)));
        if let Some(connection) = &removed {
            info!("unregistered {:?} connection {}", connection.role(), connection.id());
        }
        removed
    }

    /// Every connection, consumers first, in registration order.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let inner = self.lock();
        inner.consumers.iter().chain(inner.producers.iter()).cloned().collect()
    }

    pub fn primary_producer(&self) -> Option<Arc<Connection>> {
        self.lock().producers.first().cloned()
    }

    pub fn producer_count(&self) -> usize {
        self.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.producers.len() + inner.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop connections whose side-channel has closed. Returns how many.
    pub fn prune_closed(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.producers.len() + inner.consumers.len();
        inner.producers.retain(|c| c.is_open());
        inner.consumers.retain(|c| c.is_open());
        before - (inner.producers.len() + inner.consumers.len())
    }

    /// Remove every connection.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.producers.clear();
        inner.consumers.clear();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
