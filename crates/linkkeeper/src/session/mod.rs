//! Live sessions and the registry that tracks them.

mod handle;
mod registry;

use std::fmt;

use serde::Serialize;

pub use handle::{SendError, SessionHandle};
pub use registry::{RegisterOutcome, SessionRegistry};

/// Lifecycle status of one live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Init,
    QrWait,
    Open,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Init => "init",
            SessionStatus::QrWait => "qr_wait",
            SessionStatus::Open => "open",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
