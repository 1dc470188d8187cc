//! Connection protocol types shared by linkkeeper and protocol bridges.
//!
//! A protocol bridge owns the actual connection to the messaging provider.
//! linkkeeper talks to it through two message types:
//!
//! - **Commands** (linkkeeper → bridge): start the connection, send messages,
//!   answer message-retrieval requests, sign off, close.
//! - **Events** (bridge → linkkeeper): connection state changes, QR codes,
//!   credential updates, observed messages, message-retrieval requests.
//!
//! External bridges exchange these as JSON Lines (newline-delimited JSON)
//! over stdio.
//!
//! # Example: Minimal Bridge
//!
//! ```ignore
//! use linkkeeper_protocol::{BridgeEvent, ConnectionCommand};
//!
//! // Read the start command from stdin
//! let line = read_line_from_stdin();
//! let command: ConnectionCommand = serde_json::from_str(&line)?;
//!
//! // Report the connection as open on stdout
//! let event = BridgeEvent::Open { number: Some("5511999999999".to_string()) };
//! println!("{}", serde_json::to_string(&event)?);
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (linkkeeper → Bridge)
// ============================================================================

/// Commands sent from linkkeeper to a protocol connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionCommand {
    /// Open the connection. Always the first command written to a bridge.
    Start {
        session_id: String,
        /// Stored credentials, `None` to begin QR pairing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<serde_json::Value>,
        options: ConnectionOptions,
    },

    /// Send a message to a chat.
    SendMessage {
        request_id: String,
        message_id: String,
        to: String,
        payload: serde_json::Value,
    },

    /// Answer to a [`BridgeEvent::RetrieveMessage`] request.
    RetrieveResult {
        request_id: String,
        message_id: String,
        /// `None` when the message is not cached.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    /// Gracefully sign the device off before closing.
    Logout,

    /// Close the transport.
    Close,
}

/// Connection tuning handed to the bridge on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Timeout for establishing the connection.
    pub connect_timeout_ms: u64,
    /// Interval between keep-alive pings.
    pub keep_alive_interval_ms: u64,
    /// How long a QR code stays valid before a new one is issued.
    pub qr_timeout_ms: u64,
    /// Timeout for individual protocol queries.
    pub default_query_timeout_ms: u64,
    /// JIDs ending in any of these suffixes are ignored.
    #[serde(default)]
    pub ignored_jid_suffixes: Vec<String>,
}

impl ConnectionOptions {
    /// Check whether messages from `jid` should be ignored.
    pub fn should_ignore_jid(&self, jid: &str) -> bool {
        self.ignored_jid_suffixes
            .iter()
            .any(|suffix| jid.ends_with(suffix.as_str()))
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            keep_alive_interval_ms: 10_000,
            qr_timeout_ms: 40_000,
            default_query_timeout_ms: 60_000,
            ignored_jid_suffixes: vec!["@broadcast".to_string(), "@newsletter".to_string()],
        }
    }
}

// ============================================================================
// Events (Connection → linkkeeper)
// ============================================================================

/// Lifecycle events of one protocol connection, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The connection is being established.
    Connecting,

    /// The connection is open and authenticated.
    Open {
        /// Phone number / account the session is connected as.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        number: Option<String>,
    },

    /// The connection closed.
    Close { failure: Failure },

    /// A pairing QR code was issued.
    Qr { code: String },

    /// Credentials changed and must be persisted.
    CredsUpdate { creds: serde_json::Value },

    /// Messages observed on the connection.
    Messages { messages: Vec<WireMessage> },
}

/// Events written by an external bridge process.
///
/// A superset of [`ConnectionEvent`]: message-retrieval requests are answered
/// by the connector itself and never reach the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Connecting,
    Open {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        number: Option<String>,
    },
    Close {
        failure: Failure,
    },
    Qr {
        code: String,
    },
    CredsUpdate {
        creds: serde_json::Value,
    },
    Messages {
        messages: Vec<WireMessage>,
    },
    /// The provider asked for a message to be re-sent.
    RetrieveMessage {
        request_id: String,
        message_id: String,
    },
}

/// A message-retrieval request split off a bridge event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub request_id: String,
    pub message_id: String,
}

impl BridgeEvent {
    /// Split a bridge event into a lifecycle event or a retrieval request.
    pub fn into_connection_event(self) -> Result<ConnectionEvent, RetrieveRequest> {
        match self {
            BridgeEvent::Connecting => Ok(ConnectionEvent::Connecting),
            BridgeEvent::Open { number } => Ok(ConnectionEvent::Open { number }),
            BridgeEvent::Close { failure } => Ok(ConnectionEvent::Close { failure }),
            BridgeEvent::Qr { code } => Ok(ConnectionEvent::Qr { code }),
            BridgeEvent::CredsUpdate { creds } => Ok(ConnectionEvent::CredsUpdate { creds }),
            BridgeEvent::Messages { messages } => Ok(ConnectionEvent::Messages { messages }),
            BridgeEvent::RetrieveMessage {
                request_id,
                message_id,
            } => Err(RetrieveRequest {
                request_id,
                message_id,
            }),
        }
    }
}

/// A message as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Opaque protocol payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ============================================================================
// Failures
// ============================================================================

/// Why a connection closed.
///
/// Adapters fill in whatever they know; every field is optional so a bare
/// transport error or a free-text message can still be reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Failure {
    /// Protocol-level disconnect reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DisconnectReason>,
    /// Transport status code (HTTP-like).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Free-text error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Failure {
    /// A failure with a known protocol disconnect reason.
    pub fn protocol(reason: DisconnectReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::default()
        }
    }

    /// A failure with a transport status code.
    pub fn transport(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A failure described only by text.
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Attach a free-text message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(reason) = self.reason {
            parts.push(format!("reason={}", reason.as_str()));
        }
        if let Some(status) = self.status {
            parts.push(format!("status={status}"));
        }
        if let Some(message) = &self.message {
            parts.push(format!("message={message}"));
        }
        if parts.is_empty() {
            f.write_str("unspecified failure")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

/// Protocol disconnect reasons reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    BadSession,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    LoggedOut,
    MultideviceMismatch,
    RestartRequired,
    TimedOut,
    Forbidden,
    UnavailableService,
}

impl DisconnectReason {
    pub const ALL: [DisconnectReason; 10] = [
        DisconnectReason::BadSession,
        DisconnectReason::ConnectionClosed,
        DisconnectReason::ConnectionLost,
        DisconnectReason::ConnectionReplaced,
        DisconnectReason::LoggedOut,
        DisconnectReason::MultideviceMismatch,
        DisconnectReason::RestartRequired,
        DisconnectReason::TimedOut,
        DisconnectReason::Forbidden,
        DisconnectReason::UnavailableService,
    ];

    /// Numeric status code the provider uses for this reason.
    pub fn code(self) -> u16 {
        match self {
            DisconnectReason::BadSession => 500,
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::TimedOut => 408,
            DisconnectReason::Forbidden => 403,
            DisconnectReason::UnavailableService => 503,
        }
    }

    /// Map a provider status code back to a reason.
    ///
    /// 408 is shared by `ConnectionLost` and `TimedOut`; it maps to `TimedOut`.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            500 => Some(DisconnectReason::BadSession),
            428 => Some(DisconnectReason::ConnectionClosed),
            408 => Some(DisconnectReason::TimedOut),
            440 => Some(DisconnectReason::ConnectionReplaced),
            401 => Some(DisconnectReason::LoggedOut),
            411 => Some(DisconnectReason::MultideviceMismatch),
            515 => Some(DisconnectReason::RestartRequired),
            403 => Some(DisconnectReason::Forbidden),
            503 => Some(DisconnectReason::UnavailableService),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::BadSession => "bad_session",
            DisconnectReason::ConnectionClosed => "connection_closed",
            DisconnectReason::ConnectionLost => "connection_lost",
            DisconnectReason::ConnectionReplaced => "connection_replaced",
            DisconnectReason::LoggedOut => "logged_out",
            DisconnectReason::MultideviceMismatch => "multidevice_mismatch",
            DisconnectReason::RestartRequired => "restart_required",
            DisconnectReason::TimedOut => "timed_out",
            DisconnectReason::Forbidden => "forbidden",
            DisconnectReason::UnavailableService => "unavailable_service",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
