//! Error taxonomy and the per-code recovery policy table.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Taxonomy
// ============================================================================

/// Closed set of classified failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionClosed,
    ConnectionLost,
    ConnectionTimeout,
    ConnectionReplaced,
    AuthFailure,
    CredentialsInvalid,
    DeviceLoggedOut,
    MultiDeviceMismatch,
    SessionExpired,
    SessionInvalid,
    SessionConflict,
    NetworkError,
    RateLimited,
    ServerError,
    ProtocolError,
    VersionMismatch,
    UnsupportedFeature,
    UnknownError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 18] = [
        ErrorCode::ConnectionClosed,
        ErrorCode::ConnectionLost,
        ErrorCode::ConnectionTimeout,
        ErrorCode::ConnectionReplaced,
        ErrorCode::AuthFailure,
        ErrorCode::CredentialsInvalid,
        ErrorCode::DeviceLoggedOut,
        ErrorCode::MultiDeviceMismatch,
        ErrorCode::SessionExpired,
        ErrorCode::SessionInvalid,
        ErrorCode::SessionConflict,
        ErrorCode::NetworkError,
        ErrorCode::RateLimited,
        ErrorCode::ServerError,
        ErrorCode::ProtocolError,
        ErrorCode::VersionMismatch,
        ErrorCode::UnsupportedFeature,
        ErrorCode::UnknownError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionReplaced => "CONNECTION_REPLACED",
            ErrorCode::AuthFailure => "AUTH_FAILURE",
            ErrorCode::CredentialsInvalid => "CREDENTIALS_INVALID",
            ErrorCode::DeviceLoggedOut => "DEVICE_LOGGED_OUT",
            ErrorCode::MultiDeviceMismatch => "MULTI_DEVICE_MISMATCH",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::SessionInvalid => "SESSION_INVALID",
            ErrorCode::SessionConflict => "SESSION_CONFLICT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::UnsupportedFeature => "UNSUPPORTED_FEATURE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Remediation chosen for a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    Reconnect,
    RestartSession,
    ClearCredentials,
    ManualIntervention,
    NoRecovery,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "RETRY",
            RecoveryStrategy::Reconnect => "RECONNECT",
            RecoveryStrategy::RestartSession => "RESTART_SESSION",
            RecoveryStrategy::ClearCredentials => "CLEAR_CREDENTIALS",
            RecoveryStrategy::ManualIntervention => "MANUAL_INTERVENTION",
            RecoveryStrategy::NoRecovery => "NO_RECOVERY",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Recovery policy attached to one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub code: ErrorCode,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub retryable: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Human-readable description, for logs only.
    pub description: &'static str,
}

impl ErrorClassification {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-code override loaded from configuration.
///
/// Unset fields keep the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    pub retryable: Option<bool>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub strategy: Option<RecoveryStrategy>,
}

// ============================================================================
// Policy Table
// ============================================================================

/// Recovery policy for every [`ErrorCode`].
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<ErrorCode, ErrorClassification>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            entries: ErrorCode::ALL
                .into_iter()
                .map(|code| (code, default_policy(code)))
                .collect(),
        }
    }
}

impl PolicyTable {
    /// Built-in defaults with configured overrides applied on top.
    pub fn with_overrides(overrides: &HashMap<ErrorCode, PolicyOverride>) -> Self {
        let mut table = Self::default();
        for (code, over) in overrides {
            table.apply(*code, over);
        }
        table
    }

    pub fn apply(&mut self, code: ErrorCode, over: &PolicyOverride) {
        let entry = self
            .entries
            .entry(code)
            .or_insert_with(|| default_policy(code));
        if let Some(retryable) = over.retryable {
            entry.retryable = retryable;
        }
        if let Some(max_retries) = over.max_retries {
            entry.max_retries = max_retries;
        }
        if let Some(base) = over.base_delay_ms {
            entry.base_delay_ms = base;
        }
        if let Some(max) = over.max_delay_ms {
            entry.max_delay_ms = max;
        }
        if let Some(strategy) = over.strategy {
            entry.strategy = strategy;
        }
    }

    /// Classification for `code`.
    pub fn get(&self, code: ErrorCode) -> ErrorClassification {
        self.entries
            .get(&code)
            .cloned()
            .unwrap_or_else(|| default_policy(code))
    }

    /// All entries in taxonomy order.
    pub fn entries(&self) -> Vec<ErrorClassification> {
        ErrorCode::ALL.into_iter().map(|code| self.get(code)).collect()
    }
}

fn default_policy(code: ErrorCode) -> ErrorClassification {
    use RecoveryStrategy::*;
    use Severity::*;

    let (severity, strategy, retryable, max_retries, base_delay_ms, max_delay_ms, description) =
        match code {
            ErrorCode::ConnectionClosed => (
                Medium,
                Reconnect,
                true,
                5,
                2_000,
                30_000,
                "Connection closed by the provider",
            ),
            ErrorCode::ConnectionLost => (
                Medium,
                Reconnect,
                true,
                5,
                2_000,
                30_000,
                "Connection to the provider was lost",
            ),
            ErrorCode::ConnectionTimeout => (
                Medium,
                Retry,
                true,
                4,
                3_000,
                30_000,
                "Connection attempt timed out",
            ),
            ErrorCode::ConnectionReplaced => (
                High,
                ManualIntervention,
                false,
                0,
                0,
                0,
                "Session was opened on another device",
            ),
            ErrorCode::AuthFailure => (
                High,
                ClearCredentials,
                true,
                1,
                5_000,
                30_000,
                "Authentication rejected",
            ),
            ErrorCode::CredentialsInvalid => (
                High,
                ClearCredentials,
                true,
                1,
                5_000,
                30_000,
                "Stored credentials are invalid",
            ),
            ErrorCode::DeviceLoggedOut => (
                High,
                ClearCredentials,
                true,
                1,
                5_000,
                30_000,
                "Device was logged out",
            ),
            ErrorCode::MultiDeviceMismatch => (
                High,
                ClearCredentials,
                true,
                1,
                5_000,
                30_000,
                "Multi-device state mismatch",
            ),
            ErrorCode::SessionExpired => (
                Medium,
                RestartSession,
                true,
                3,
                1_000,
                10_000,
                "Provider requested a session restart",
            ),
            ErrorCode::SessionInvalid => (
                High,
                ClearCredentials,
                true,
                1,
                5_000,
                30_000,
                "Session state is corrupt",
            ),
            ErrorCode::SessionConflict => (
                High,
                ManualIntervention,
                true,
                1,
                10_000,
                60_000,
                "Conflicting session detected",
            ),
            ErrorCode::NetworkError => (
                Medium,
                Retry,
                true,
                5,
                5_000,
                60_000,
                "Network failure",
            ),
            ErrorCode::RateLimited => (
                Medium,
                Retry,
                true,
                3,
                60_000,
                300_000,
                "Rate limited by the provider",
            ),
            ErrorCode::ServerError => (
                Medium,
                Retry,
                true,
                3,
                10_000,
                120_000,
                "Provider server error",
            ),
            ErrorCode::ProtocolError => (
                High,
                RestartSession,
                true,
                2,
                5_000,
                30_000,
                "Protocol violation",
            ),
            ErrorCode::VersionMismatch => (
                Critical,
                NoRecovery,
                false,
                0,
                0,
                0,
                "Client version is no longer supported",
            ),
            ErrorCode::UnsupportedFeature => (
                Low,
                NoRecovery,
                false,
                0,
                0,
                0,
                "Feature not supported by the provider",
            ),
            ErrorCode::UnknownError => (
                Medium,
                Retry,
                true,
                2,
                5_000,
                30_000,
                "Unclassified failure",
            ),
        };

    ErrorClassification {
        code,
        severity,
        strategy,
        retryable,
        max_retries,
        base_delay_ms,
        max_delay_ms,
        description,
    }
}
