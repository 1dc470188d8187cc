//! Credential storage trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::StorageResult;

/// Opaque per-session credential blob produced by the protocol layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(serde_json::Value);

impl Credentials {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Storage interface for session credentials.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Load stored credentials.
    ///
    /// Returns `Ok(None)` if the session has never been paired.
    async fn load(&self, session_id: &str) -> StorageResult<Option<Credentials>>;

    /// Persist credentials, replacing previous ones.
    async fn save(&self, session_id: &str, credentials: &Credentials) -> StorageResult<()>;

    /// Remove stored credentials. Idempotent.
    async fn clear(&self, session_id: &str) -> StorageResult<()>;

    /// Whether stored credentials are usable for a connection attempt.
    ///
    /// Defaults to "a non-empty JSON object".
    fn validate(&self, credentials: &Credentials) -> bool {
        credentials
            .as_value()
            .as_object()
            .is_some_and(|map| !map.is_empty())
    }
}
