//! File-based storage implementations.
//!
//! - JSON for credential blobs (`{auth_dir}/{session_id}.json`)
//! - YAML for tenant records (`{tenants_dir}/{session_id}.yaml`)
//!
//! All writes use atomic operations (temp file + rename) to prevent corruption.

mod auth;
mod tenant;

use std::path::Path;

use tokio::fs;

use crate::store::error::{StorageError, StorageResult};

pub use auth::FileAuthStore;
pub use tenant::FileTenantStore;

/// Write `contents` to `tmp_path`, then rename it over `path`.
pub(crate) async fn atomic_write_file(
    tmp_path: &Path,
    path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::file_io(parent, e))?;
    }

    fs::write(tmp_path, contents)
        .await
        .map_err(|e| StorageError::file_io(tmp_path, e))?;

    fs::rename(tmp_path, path)
        .await
        .map_err(|e| StorageError::file_io(path, e))
}

/// Reject ids that would escape the storage directory.
pub(crate) fn check_id(entity_type: &'static str, id: &str) -> StorageResult<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_id(entity_type, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_id_rejects_path_traversal() {
        assert!(check_id("session", "tenant-1").is_ok());
        assert!(check_id("session", "").is_err());
        assert!(check_id("session", "..").is_err());
        assert!(check_id("session", "../etc").is_err());
        assert!(check_id("session", "a\\b").is_err());
    }
}
