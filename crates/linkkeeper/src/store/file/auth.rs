use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::store::auth::{AuthStore, Credentials};
use crate::store::error::{StorageError, StorageResult};

/// File-based implementation of [`AuthStore`].
///
/// One JSON document per session:
/// ```text
/// {auth_dir}/
///   {session_id}.json
/// ```
#[derive(Debug, Clone)]
pub struct FileAuthStore {
    auth_dir: PathBuf,
}

impl FileAuthStore {
    /// The directory is created on first save.
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
        }
    }

    fn credentials_path(&self, session_id: &str) -> StorageResult<PathBuf> {
        super::check_id("session", session_id)?;
        Ok(self.auth_dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn load(&self, session_id: &str) -> StorageResult<Option<Credentials>> {
        let path = self.credentials_path(session_id)?;

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        let credentials = serde_json::from_str(&content)
            .map_err(|e| StorageError::file_deserialization(&path, e))?;

        Ok(Some(credentials))
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> StorageResult<()> {
        let path = self.credentials_path(session_id)?;
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_vec(credentials)
            .map_err(StorageError::serialization)?;

        super::atomic_write_file(&tmp_path, &path, &content).await
    }

    async fn clear(&self, session_id: &str) -> StorageResult<()> {
        let path = self.credentials_path(session_id)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }
}
