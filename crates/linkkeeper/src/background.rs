//! Registry of supervisor-owned tasks.
//!
//! Event loops and deferred retries are spawned through [`BackgroundTasks`]
//! so shutdown can wait for them, then abort whatever is still running.

// std::sync::Mutex is fine here: the lock is never held across .await points.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task and track its handle.
    ///
    /// The handle is registered before returning, so a task that finishes
    /// immediately is still accounted for.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);

        let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }

    /// Wait up to `grace` for tracked tasks, then abort the rest.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let handles: Vec<_> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));

        let count = handles.len();
        if count == 0 {
            return 0;
        }

        info!(count, "Waiting for background tasks to complete");

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = i, error = %e, "Background task panicked"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            warn!(aborted, "Aborted background tasks after grace period");
        } else {
            info!("All background tasks completed");
        }
        aborted
    }

    pub fn pending_count(&self) -> usize {
        let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|h| !h.is_finished());
        guard.len()
    }
}
