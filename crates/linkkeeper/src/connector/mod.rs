//! Protocol connection factory.
//!
//! A [`Connector`] opens one protocol connection per session and hands back
//! a [`Connection`]: a command sender and a typed event receiver. The
//! supervisor never talks to the provider directly.

mod subprocess;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use linkkeeper_protocol::{ConnectionCommand, ConnectionEvent, ConnectionOptions};

use crate::cache::MessageCache;
use crate::store::Credentials;

pub use subprocess::SubprocessConnector;

/// Capacity of the per-connection command and event channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// Everything a connector needs to open one connection.
#[derive(Clone)]
pub struct ConnectRequest {
    pub session_id: String,
    pub tenant_id: String,
    /// Stored credentials, `None` to start QR pairing.
    pub credentials: Option<Credentials>,
    pub options: ConnectionOptions,
    /// Backs the provider's message-retrieval callback.
    pub messages: MessageCache,
}

/// A live protocol connection.
///
/// The event stream ends after a `Close` event or when the connection dies.
pub struct Connection {
    pub commands: mpsc::Sender<ConnectionCommand>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to spawn protocol bridge: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("protocol bridge rejected the connection: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, ConnectError>;
}
