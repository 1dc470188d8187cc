//! Storage abstractions for credentials and tenant records.
//!
//! Traits live here; file-backed implementations live in [`file`].

mod auth;
pub mod error;
pub mod file;
mod tenant;

pub use auth::{AuthStore, Credentials};
pub use error::{StorageError, StorageResult};
pub use tenant::{TenantRecord, TenantStatus, TenantStore, TenantUpdate};
