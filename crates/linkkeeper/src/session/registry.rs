//! Process-wide registry of live sessions.
//!
//! Holds at most one handle per session id and owns the per-id generation
//! counter. Deferred work captures a generation and compares it with
//! [`SessionRegistry::generation`] before acting.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::handle::SessionHandle;

#[derive(Debug)]
pub enum RegisterOutcome {
    Inserted,
    /// The same connection was already registered.
    AlreadyRegistered,
    /// A different connection was registered under the id and was detached.
    Replaced(SessionHandle),
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    handles: Arc<DashMap<String, SessionHandle>>,
    generations: Arc<DashMap<String, u64>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Generations
    // ------------------------------------------------------------------------

    /// Current generation of `id`; 0 if it was never advanced.
    pub fn generation(&self, id: &str) -> u64 {
        self.generations.get(id).map(|g| *g).unwrap_or(0)
    }

    /// Advance the generation of `id`, invalidating anything captured before.
    pub fn advance_generation(&self, id: &str) -> u64 {
        let mut generation = self.generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Whether `generation` is still the live generation of `id`.
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.generation(id) == generation
    }

    // ------------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------------

    pub fn register(&self, handle: SessionHandle) -> RegisterOutcome {
        match self.handles.entry(handle.id().to_string()) {
            Entry::Vacant(entry) => {
                debug!(session_id = %handle.id(), generation = handle.generation(), "Registered session");
                entry.insert(handle);
                RegisterOutcome::Inserted
            }
            Entry::Occupied(mut entry) => {
                if entry.get().same_connection(&handle) {
                    RegisterOutcome::AlreadyRegistered
                } else {
                    let old = entry.insert(handle);
                    warn!(
                        session_id = %old.id(),
                        old_generation = old.generation(),
                        "Replaced registered session"
                    );
                    RegisterOutcome::Replaced(old)
                }
            }
        }
    }

    pub fn find(&self, id: &str) -> Option<SessionHandle> {
        self.handles.get(id).map(|h| h.value().clone())
    }

    pub fn find_by_tenant(&self, tenant_id: &str) -> Vec<SessionHandle> {
        self.handles
            .iter()
            .filter(|entry| entry.value().tenant_id() == tenant_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn list(&self) -> Vec<SessionHandle> {
        self.handles.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove the session registered under `id`. Idempotent.
    ///
    /// With `logout`, the handle is asked to sign off and then to close its
    /// transport before it is detached. Failures of either step are logged.
    /// Returns whether a session was detached.
    pub async fn remove(&self, id: &str, logout: bool) -> bool {
        let Some(handle) = self.find(id) else {
            return false;
        };

        if logout {
            if let Err(e) = handle.logout().await {
                warn!(session_id = %id, error = %e, "Failed to log out session");
            }
            if let Err(e) = handle.close().await {
                warn!(session_id = %id, error = %e, "Failed to close session transport");
            }
        }

        // Re-check after the awaits: only detach the handle we looked up.
        let removed = self
            .handles
            .remove_if(id, |_, current| current.same_connection(&handle))
            .is_some();
        if removed {
            debug!(session_id = %id, logout, "Removed session");
        }
        removed
    }

    /// Close every registered session and clear the registry.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.list();
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "Closing registered sessions");
        let results = join_all(handles.iter().map(|handle| handle.close())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                debug!(session_id = %handle.id(), error = %e, "Session already closed");
            }
        }
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
