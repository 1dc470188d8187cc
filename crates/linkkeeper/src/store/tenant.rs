//! Tenant record storage trait.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageResult;

/// Connection status as seen by the rest of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Opening,
    Qrcode,
    Connected,
    Pending,
    Disconnected,
}

impl TenantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TenantStatus::Opening => "OPENING",
            TenantStatus::Qrcode => "QRCODE",
            TenantStatus::Connected => "CONNECTED",
            TenantStatus::Pending => "PENDING",
            TenantStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one tenant session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Session id.
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: TenantStatus,
    /// Last issued pairing QR payload, empty when none is pending.
    #[serde(default)]
    pub qr_code: String,
    /// Manual-intervention retry counter.
    #[serde(default)]
    pub retries: u32,
    /// Account the session is connected as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            status: TenantStatus::Pending,
            qr_code: String::new(),
            retries: 0,
            number: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply a partial update and bump `updated_at`.
    pub fn apply(&mut self, update: &TenantUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(qr_code) = &update.qr_code {
            self.qr_code.clone_from(qr_code);
        }
        if let Some(retries) = update.retries {
            self.retries = retries;
        }
        if update.increment_retries {
            self.retries = self.retries.saturating_add(1);
        }
        if let Some(number) = &update.number {
            self.number = Some(number.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a [`TenantRecord`]. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantUpdate {
    pub status: Option<TenantStatus>,
    pub qr_code: Option<String>,
    pub retries: Option<u32>,
    pub increment_retries: bool,
    pub number: Option<String>,
}

impl TenantUpdate {
    pub fn status(status: TenantStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_qr_code(mut self, qr_code: impl Into<String>) -> Self {
        self.qr_code = Some(qr_code.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn increment_retries(mut self) -> Self {
        self.increment_retries = true;
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }
}

/// Storage interface for tenant records.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, id: &str) -> StorageResult<Option<TenantRecord>>;

    /// Write a full record, replacing any existing one.
    async fn put(&self, record: &TenantRecord) -> StorageResult<()>;

    /// Apply a partial update to an existing record and return the result.
    ///
    /// Fails with `NotFound` if the record does not exist.
    async fn update(&self, id: &str, update: &TenantUpdate) -> StorageResult<TenantRecord>;
}
