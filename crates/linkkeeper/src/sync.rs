//! Per-key async locks.
//!
//! The supervisor holds one lock per session so initialization never
//! interleaves with that session's event handling. File stores use the same
//! primitive to serialize read-modify-write cycles per record.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

/// Default interval between cleanup runs (1 hour).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default idle age before an unused lock is dropped (2 hours).
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(7200);

type LockStorage = DashMap<String, (Arc<Mutex<()>>, Instant)>;

/// Async mutex per key. Different keys never contend.
///
/// ```ignore
/// let locks = KeyedLocks::new();
/// let lock = locks.get("tenant-1");
/// let _guard = lock.lock().await;
/// // A second `locks.get("tenant-1").lock().await` waits here.
/// ```
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<LockStorage>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for `key`, refreshing its last-access time.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let now = Instant::now();
        self.locks
            .entry(key.to_string())
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Mutex::new(())), now))
            .0
            .clone()
    }

    /// Drop locks idle for longer than `max_age` that nobody references.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        self.locks.retain(|_, (lock, last_access)| {
            // strong_count == 1: only this map holds the lock
            Arc::strong_count(lock) > 1 || now.duration_since(*last_access) <= max_age
        });
        before.saturating_sub(self.locks.len())
    }

    /// Periodically drop stale locks until `shutdown` flips to `true`.
    pub fn spawn_cleanup_task(
        self,
        interval: Duration,
        max_age: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.cleanup_stale(max_age);
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "Cleaned up stale session locks");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
