//! Errors shared by the credential and tenant stores.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading, writing or renaming a store file failed.
    #[error("I/O error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A store file exists but does not parse.
    #[error("corrupt store file {path}: {message}")]
    FileDeserialization { path: PathBuf, message: String },

    #[error("failed to serialize record: {0}")]
    Serialization(String),

    #[error("{entity_type} not found: {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    /// The id would escape the store directory or is empty.
    #[error("invalid {entity_type} id: {id:?}")]
    InvalidId {
        entity_type: &'static str,
        id: String,
    },
}

impl StorageError {
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    pub fn file_deserialization(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::FileDeserialization {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn serialization(message: impl ToString) -> Self {
        Self::Serialization(message.to_string())
    }

    pub fn not_found(entity_type: &'static str, id: &str) -> Self {
        Self::NotFound {
            entity_type,
            id: id.to_string(),
        }
    }

    pub fn invalid_id(entity_type: &'static str, id: &str) -> Self {
        Self::InvalidId {
            entity_type,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
