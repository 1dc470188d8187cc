//! Fan-out of tenant session updates.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::TenantRecord;

/// Published whenever a tenant record changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantSessionUpdate {
    pub action: UpdateAction,
    pub record: TenantRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Update,
}

impl TenantSessionUpdate {
    pub fn update(record: TenantRecord) -> Self {
        Self {
            action: UpdateAction::Update,
            record,
        }
    }
}

/// Fire-and-forget publisher. Implementations must not fail the caller.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, update: TenantSessionUpdate);
}

/// In-process bus backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<TenantSessionUpdate>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TenantSessionUpdate> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, update: TenantSessionUpdate) {
        let session_id = update.record.id.clone();
        // No subscribers is fine.
        if self.tx.send(update).is_err() {
            trace!(session_id = %session_id, "No subscribers for tenant update");
        }
    }
}
