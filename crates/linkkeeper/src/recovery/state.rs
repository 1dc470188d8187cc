//! Per-session recovery state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::backoff::BackoffPolicy;
use super::policy::{ErrorClassification, ErrorCode, RecoveryStrategy};

/// Consecutive failures after which automatic retries stop.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryState {
    pub session_id: String,
    pub retry_count: u32,
    pub last_error_code: Option<ErrorCode>,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub recovery_in_progress: bool,
    pub consecutive_failures: u32,
}

impl RecoveryState {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            retry_count: 0,
            last_error_code: None,
            last_retry_time: None,
            recovery_in_progress: false,
            consecutive_failures: 0,
        }
    }
}

/// Outcome of [`RecoveryTracker::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry {
        strategy: RecoveryStrategy,
        /// Retry number this delay applies to, starting at 1.
        attempt: u32,
        delay: Duration,
    },
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    RetriesExhausted,
    CircuitOpen,
    /// Another recovery already owns the session.
    RecoveryInProgress,
}

impl GiveUpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GiveUpReason::NotRetryable => "not_retryable",
            GiveUpReason::RetriesExhausted => "retries_exhausted",
            GiveUpReason::CircuitOpen => "circuit_open",
            GiveUpReason::RecoveryInProgress => "recovery_in_progress",
        }
    }
}

/// Retry bookkeeping for all sessions.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    states: Arc<DashMap<String, RecoveryState>>,
    circuit_breaker_threshold: u32,
    backoff: BackoffPolicy,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CIRCUIT_BREAKER_THRESHOLD, BackoffPolicy::default())
    }
}

impl RecoveryTracker {
    pub fn new(circuit_breaker_threshold: u32, backoff: BackoffPolicy) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            circuit_breaker_threshold,
            backoff,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Record a failure and return the updated state.
    pub fn record_failure(
        &self,
        session_id: &str,
        classification: &ErrorClassification,
    ) -> RecoveryState {
        let mut state = self
            .states
            .entry(session_id.to_string())
            .or_insert_with(|| RecoveryState::new(session_id));
        state.retry_count = state.retry_count.saturating_add(1);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error_code = Some(classification.code);
        state.last_retry_time = Some(Utc::now());
        state.value().clone()
    }

    pub fn is_retryable(&self, session_id: &str, classification: &ErrorClassification) -> bool {
        self.check(session_id, classification).is_ok()
    }

    /// Check retryability against the current state, record the failure,
    /// then compute the delay for the new retry count.
    pub fn decide(
        &self,
        session_id: &str,
        classification: &ErrorClassification,
    ) -> RecoveryDecision {
        let verdict = self.check(session_id, classification);
        if verdict == Err(GiveUpReason::RecoveryInProgress) {
            return RecoveryDecision::GiveUp {
                reason: GiveUpReason::RecoveryInProgress,
            };
        }

        let state = self.record_failure(session_id, classification);
        match verdict {
            Ok(()) => RecoveryDecision::Retry {
                strategy: classification.strategy,
                attempt: state.retry_count,
                delay: self.backoff.delay(
                    state.retry_count,
                    classification.base_delay(),
                    classification.max_delay(),
                ),
            },
            Err(reason) => RecoveryDecision::GiveUp { reason },
        }
    }

    pub fn record_success(&self, session_id: &str) {
        if let Some(mut state) = self.states.get_mut(session_id) {
            state.retry_count = 0;
            state.consecutive_failures = 0;
            state.recovery_in_progress = false;
        }
    }

    pub fn set_recovery_in_progress(&self, session_id: &str, in_progress: bool) {
        self.states
            .entry(session_id.to_string())
            .or_insert_with(|| RecoveryState::new(session_id))
            .recovery_in_progress = in_progress;
    }

    /// Drop all recovery state for a session.
    pub fn clear(&self, session_id: &str) -> bool {
        self.states.remove(session_id).is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<RecoveryState> {
        self.states.get(session_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn check(
        &self,
        session_id: &str,
        classification: &ErrorClassification,
    ) -> Result<(), GiveUpReason> {
        if !classification.retryable {
            return Err(GiveUpReason::NotRetryable);
        }
        let Some(state) = self.states.get(session_id) else {
            return if classification.max_retries == 0 {
                Err(GiveUpReason::RetriesExhausted)
            } else {
                Ok(())
            };
        };
        if state.retry_count >= classification.max_retries {
            return Err(GiveUpReason::RetriesExhausted);
        }
        if state.consecutive_failures >= self.circuit_breaker_threshold {
            return Err(GiveUpReason::CircuitOpen);
        }
        if state.recovery_in_progress {
            return Err(GiveUpReason::RecoveryInProgress);
        }
        Ok(())
    }
}
