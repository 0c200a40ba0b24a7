use std::future::Future;
use std::sync::Arc;

use skein_common::{Result, RpcError};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Runs service handlers off the connection tasks.
///
/// At most `size` handlers exist at once. [`spawn`](Self::spawn) waits for a
/// free slot before the task is created, so callers feel the bound. After
/// [`shutdown`](Self::shutdown) starts, new and waiting tasks are rejected
/// while running ones are allowed to finish.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `size` handlers concurrently (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            size,
        }
    }

    /// Waits for a free slot, then starts `task`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Server` once the pool is shutting down.
    pub async fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) if !self.tracker.is_closed() => permit,
            _ => return Err(RpcError::Server("worker pool is shut down".to_string())),
        };
        self.tracker.spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stops accepting tasks and waits for the accepted ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.permits.close();
        let remaining = self.tracker.len();
        if remaining > 0 {
            info!(remaining, "Draining worker pool");
        }
        self.tracker.wait().await;
        debug!("Worker pool drained");
    }
}
