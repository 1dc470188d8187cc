use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::store::error::{StorageError, StorageResult};
use crate::store::tenant::{TenantRecord, TenantStore, TenantUpdate};
use crate::sync::KeyedLocks;

/// File-based implementation of [`TenantStore`].
///
/// One YAML record per session:
/// ```text
/// {tenants_dir}/
///   {session_id}.yaml
/// ```
///
/// Read-modify-write updates are serialized per session.
#[derive(Clone)]
pub struct FileTenantStore {
    tenants_dir: PathBuf,
    locks: KeyedLocks,
}

impl FileTenantStore {
    pub fn new(tenants_dir: impl Into<PathBuf>) -> Self {
        Self {
            tenants_dir: tenants_dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    fn record_path(&self, id: &str) -> StorageResult<PathBuf> {
        super::check_id("tenant", id)?;
        Ok(self.tenants_dir.join(format!("{id}.yaml")))
    }

    async fn read(&self, id: &str) -> StorageResult<Option<TenantRecord>> {
        let path = self.record_path(id)?;

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        let record = serde_saphyr::from_str(&content)
            .map_err(|e| StorageError::file_deserialization(&path, e))?;

        Ok(Some(record))
    }

    async fn write(&self, record: &TenantRecord) -> StorageResult<()> {
        let path = self.record_path(&record.id)?;
        let tmp_path = path.with_extension("yaml.tmp");

        let content = serde_saphyr::to_string(record)
            .map_err(StorageError::serialization)?;

        super::atomic_write_file(&tmp_path, &path, content.as_bytes()).await
    }
}

#[async_trait]
impl TenantStore for FileTenantStore {
    async fn get(&self, id: &str) -> StorageResult<Option<TenantRecord>> {
        self.read(id).await
    }

    async fn put(&self, record: &TenantRecord) -> StorageResult<()> {
        let lock = self.locks.get(&record.id);
        let _guard = lock.lock().await;
        self.write(record).await
    }

    async fn update(&self, id: &str, update: &TenantUpdate) -> StorageResult<TenantRecord> {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let mut record = self
            .read(id)
            .await?
            .ok_or_else(|| StorageError::not_found("tenant", id))?;
        record.apply(update);
        self.write(&record).await?;

        tracing::debug!(session_id = %id, status = %record.status, "Updated tenant record");
        Ok(record)
    }
}
