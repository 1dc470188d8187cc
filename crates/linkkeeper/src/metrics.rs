//! Per-session connection counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::recovery::ErrorCode;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub reconnections: u64,
    pub qr_codes_issued: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorCode>,
}

impl SessionMetrics {
    fn absorb(&mut self, other: &SessionMetrics) {
        self.connection_attempts += other.connection_attempts;
        self.successful_connections += other.successful_connections;
        self.failed_connections += other.failed_connections;
        self.reconnections += other.reconnections;
        self.qr_codes_issued += other.qr_codes_issued;
        self.messages_received += other.messages_received;
        self.messages_sent += other.messages_sent;
        if other.last_connected_at > self.last_connected_at {
            self.last_connected_at = other.last_connected_at;
        }
    }
}

/// Collects counters for every session.
///
/// Readers only ever receive copies.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    sessions: Arc<DashMap<String, SessionMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, session_id: &str, f: impl FnOnce(&mut SessionMetrics)) {
        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        f(entry.value_mut());
    }

    pub fn record_connection_attempt(&self, session_id: &str) {
        self.update(session_id, |m| m.connection_attempts += 1);
    }

    pub fn record_connected(&self, session_id: &str) {
        self.update(session_id, |m| {
            m.successful_connections += 1;
            m.last_connected_at = Some(Utc::now());
        });
    }

    pub fn record_failure(&self, session_id: &str, code: ErrorCode) {
        self.update(session_id, |m| {
            m.failed_connections += 1;
            m.last_error = Some(code);
        });
    }

    pub fn record_reconnection(&self, session_id: &str) {
        self.update(session_id, |m| m.reconnections += 1);
    }

    pub fn record_qr_code(&self, session_id: &str) {
        self.update(session_id, |m| m.qr_codes_issued += 1);
    }

    pub fn record_messages_received(&self, session_id: &str, count: u64) {
        if count > 0 {
            self.update(session_id, |m| m.messages_received += count);
        }
    }

    pub fn record_message_sent(&self, session_id: &str) {
        self.update(session_id, |m| m.messages_sent += 1);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMetrics> {
        self.sessions.get(session_id).map(|m| m.value().clone())
    }

    /// Copy of every session's counters, ordered by session id.
    pub fn snapshot(&self) -> BTreeMap<String, SessionMetrics> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Sum of all sessions' counters.
    pub fn totals(&self) -> SessionMetrics {
        let mut totals = SessionMetrics::default();
        for entry in self.sessions.iter() {
            totals.absorb(entry.value());
        }
        totals
    }

    /// Reset one session's counters, or every session's with `None`.
    pub fn reset(&self, session_id: Option<&str>) {
        match session_id {
            Some(id) => {
                self.sessions.remove(id);
            }
            None => self.sessions.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
