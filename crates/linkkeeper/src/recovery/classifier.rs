//! Classification of connection failures into error codes.

use linkkeeper_protocol::{DisconnectReason, Failure};

use super::policy::{ErrorClassification, ErrorCode, PolicyTable};

/// Maps connection failures to recovery policy.
///
/// Resolution order, first match wins: protocol disconnect reason, transport
/// status code, message text, then [`ErrorCode::UnknownError`].
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    policies: PolicyTable,
}

impl Classifier {
    pub fn new(policies: PolicyTable) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn classify(&self, failure: &Failure) -> ErrorClassification {
        self.policies.get(resolve_code(failure))
    }
}

/// Resolve the error code for a failure without looking up its policy.
pub fn resolve_code(failure: &Failure) -> ErrorCode {
    if let Some(reason) = failure.reason {
        return code_for_reason(reason);
    }
    if let Some(status) = failure.status
        && let Some(code) = code_for_status(status)
    {
        return code;
    }
    if let Some(message) = failure.message.as_deref()
        && let Some(code) = code_for_message(message)
    {
        return code;
    }
    ErrorCode::UnknownError
}

fn code_for_reason(reason: DisconnectReason) -> ErrorCode {
    match reason {
        DisconnectReason::BadSession => ErrorCode::SessionInvalid,
        DisconnectReason::ConnectionClosed => ErrorCode::ConnectionClosed,
        DisconnectReason::ConnectionLost => ErrorCode::ConnectionLost,
        DisconnectReason::LoggedOut => ErrorCode::DeviceLoggedOut,
        DisconnectReason::ConnectionReplaced => ErrorCode::ConnectionReplaced,
        DisconnectReason::RestartRequired => ErrorCode::SessionExpired,
        DisconnectReason::TimedOut => ErrorCode::ConnectionTimeout,
        DisconnectReason::MultideviceMismatch => ErrorCode::MultiDeviceMismatch,
        DisconnectReason::Forbidden => ErrorCode::AuthFailure,
        DisconnectReason::UnavailableService => ErrorCode::ServerError,
    }
}

fn code_for_status(status: u16) -> Option<ErrorCode> {
    match status {
        401 | 403 => Some(ErrorCode::AuthFailure),
        408 => Some(ErrorCode::ConnectionTimeout),
        409 => Some(ErrorCode::SessionConflict),
        426 => Some(ErrorCode::VersionMismatch),
        429 => Some(ErrorCode::RateLimited),
        500 | 502 | 503 | 504 => Some(ErrorCode::ServerError),
        500..=599 => Some(ErrorCode::NetworkError),
        _ => None,
    }
}

const NETWORK_PATTERNS: [&str; 7] = [
    "network",
    "enotfound",
    "eai_again",
    "econnreset",
    "econnrefused",
    "socket hang up",
    "dns",
];

fn code_for_message(message: &str) -> Option<ErrorCode> {
    let message = message.to_lowercase();
    if message.contains("timeout") || message.contains("timed out") {
        return Some(ErrorCode::ConnectionTimeout);
    }
    if NETWORK_PATTERNS.iter().any(|p| message.contains(p)) {
        return Some(ErrorCode::NetworkError);
    }
    if message.contains("version") {
        return Some(ErrorCode::VersionMismatch);
    }
    if message.contains("protocol") {
        return Some(ErrorCode::ProtocolError);
    }
    if message.contains("unsupported") {
        return Some(ErrorCode::UnsupportedFeature);
    }
    if message.contains("conflict") {
        return Some(ErrorCode::SessionConflict);
    }
    None
}
