use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool for CPU-bound work, shared by every track.
///
/// Each job holds one permit for its whole run on tokio's blocking threads, so
/// at most `size` jobs execute at once across the process.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running job.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free permit.
    pub async fn acquire(&self) -> Result<WorkerSlot> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("worker pool closed"))?;
        Ok(WorkerSlot { permit })
    }

    /// Run `job` on a blocking thread once a permit is free.
    ///
    /// A panic inside the job is reported as an error.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.acquire().await?.run(job).await
    }
}

/// A held worker permit, released when the job it runs finishes.
#[derive(Debug)]
pub struct WorkerSlot {
    permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub async fn run<F, T>(self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.permit;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| anyhow!("worker job did not complete: {}", e))?
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}
