//! Handle to one live protocol connection.
//!
//! `SessionHandle` wraps the connection's command sender plus a watch
//! channel carrying the session status. It is cheap to clone.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use linkkeeper_protocol::ConnectionCommand;

use super::SessionStatus;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection command channel closed")]
    ChannelClosed,
}

#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tenant_id: String,
    generation: u64,
    commands: mpsc::Sender<ConnectionCommand>,
    status: Arc<watch::Sender<SessionStatus>>,
    created_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        generation: u64,
        commands: mpsc::Sender<ConnectionCommand>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Init);
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            generation,
            commands,
            status: Arc::new(status),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Generation of the session id this handle was created under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    /// Whether both handles drive the same connection.
    pub fn same_connection(&self, other: &SessionHandle) -> bool {
        self.generation == other.generation && self.commands.same_channel(&other.commands)
    }

    pub async fn send(&self, command: ConnectionCommand) -> Result<(), SendError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Ask the provider to sign this device off.
    pub async fn logout(&self) -> Result<(), SendError> {
        self.send(ConnectionCommand::Logout).await
    }

    /// Close the transport. The connection reports a close event afterwards.
    pub async fn close(&self) -> Result<(), SendError> {
        self.set_status(SessionStatus::Closing);
        self.send(ConnectionCommand::Close).await
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.same_connection(other)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("generation", &self.generation)
            .field("status", &self.status())
            .finish()
    }
}
