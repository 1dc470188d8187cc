//! Per-connection event handling.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use linkkeeper_protocol::{ConnectionEvent, DisconnectReason, Failure, WireMessage};

use crate::config::TenantConfig;
use crate::session::{RegisterOutcome, SessionHandle, SessionStatus};
use crate::store::{Credentials, TenantStatus, TenantUpdate};

use super::{SessionEnded, Supervisor};

/// Whether the event loop keeps consuming after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Stop,
}

impl Supervisor {
    /// Consume the events of one connection in order.
    ///
    /// Each event is handled under the session lock and only while the
    /// connection's generation is current.
    pub(super) async fn run_events(
        self,
        tenant: TenantConfig,
        handle: SessionHandle,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        let id = handle.id().to_string();
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        loop {
            let received = tokio::select! {
                event = events.recv() => event,
                _ = super::shutdown_requested(&mut shutdown) => {
                    debug!(session_id = %id, "Event loop stopped by shutdown");
                    return;
                }
            };
            if self.is_shutting_down() {
                return;
            }

            let (event, stream_ended) = match received {
                Some(event) => (event, false),
                None => {
                    let failure = Failure::protocol(DisconnectReason::ConnectionLost)
                        .with_message("event stream ended without a close event");
                    (ConnectionEvent::Close { failure }, true)
                }
            };

            let lock = self.inner.locks.get(&id);
            let _guard = lock.lock().await;
            if !self.inner.registry.is_current(&id, handle.generation()) {
                debug!(
                    session_id = %id,
                    generation = handle.generation(),
                    "Discarding events of superseded connection"
                );
                return;
            }

            if self.handle_event(&tenant, &handle, event).await == Flow::Stop || stream_ended {
                return;
            }
        }
    }

    async fn handle_event(
        &self,
        tenant: &TenantConfig,
        handle: &SessionHandle,
        event: ConnectionEvent,
    ) -> Flow {
        match event {
            ConnectionEvent::Connecting => {
                handle.set_status(SessionStatus::Init);
                debug!(session_id = %handle.id(), "Connecting");
                Flow::Continue
            }
            ConnectionEvent::Qr { code } => self.on_qr(handle, code).await,
            ConnectionEvent::Open { number } => {
                self.on_open(handle, number).await;
                Flow::Continue
            }
            ConnectionEvent::CredsUpdate { creds } => {
                self.on_creds_update(handle.id(), Credentials::new(creds))
                    .await;
                Flow::Continue
            }
            ConnectionEvent::Messages { messages } => {
                self.on_messages(handle.id(), messages).await;
                Flow::Continue
            }
            ConnectionEvent::Close { failure } => {
                self.on_close(tenant, handle, failure).await;
                Flow::Stop
            }
        }
    }

    // ========================================================================
    // Pairing
    // ========================================================================

    async fn on_qr(&self, handle: &SessionHandle, code: String) -> Flow {
        let id = handle.id();
        let attempts = {
            let mut counter = self.inner.qr_counters.entry(id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.inner.metrics.record_qr_code(id);

        if attempts >= self.inner.qr_max_attempts {
            warn!(session_id = %id, attempts, "QR code was never scanned, giving up pairing");
            if let Err(e) = self.inner.auth.clear(id).await {
                warn!(session_id = %id, error = %e, "Failed to clear credentials");
            }
            self.inner.qr_counters.remove(id);
            self.update_tenant_logged(
                id,
                TenantUpdate::status(TenantStatus::Disconnected).with_qr_code(""),
            )
            .await;
            self.inner.registry.remove(id, false).await;
            self.inner.recovery.clear(id);
            if let Err(e) = handle.close().await {
                debug!(session_id = %id, error = %e, "Connection already closed");
            }
            handle.set_status(SessionStatus::Closed);
            self.resolve_pending(
                id,
                handle.generation(),
                Err(SessionEnded::QrAttemptsExhausted(attempts)),
            );
            return Flow::Stop;
        }

        handle.set_status(SessionStatus::QrWait);
        self.update_tenant_logged(
            id,
            TenantUpdate::status(TenantStatus::Qrcode).with_qr_code(code),
        )
        .await;
        info!(session_id = %id, attempt = attempts, "QR code issued");
        Flow::Continue
    }

    // ========================================================================
    // Open
    // ========================================================================

    async fn on_open(&self, handle: &SessionHandle, number: Option<String>) {
        let id = handle.id();
        self.inner.qr_counters.remove(id);
        handle.set_status(SessionStatus::Open);
        self.inner.recovery.record_success(id);
        self.inner.metrics.record_connected(id);

        if let RegisterOutcome::Replaced(old) = self.inner.registry.register(handle.clone())
            && let Err(e) = old.close().await
        {
            debug!(session_id = %id, error = %e, "Replaced connection already closed");
        }

        let mut update = TenantUpdate::status(TenantStatus::Connected)
            .with_qr_code("")
            .with_retries(0);
        if let Some(number) = &number {
            update = update.with_number(number.clone());
        }
        self.update_tenant_logged(id, update).await;
        self.resolve_pending(id, handle.generation(), Ok(()));
        info!(
            session_id = %id,
            tenant_id = %handle.tenant_id(),
            number = number.as_deref().unwrap_or(""),
            "Session connected"
        );
    }

    // ========================================================================
    // Credentials and Messages
    // ========================================================================

    async fn on_creds_update(&self, id: &str, credentials: Credentials) {
        let Err(e) = self.inner.auth.save(id, &credentials).await else {
            debug!(session_id = %id, "Persisted credentials");
            return;
        };

        let stored_valid = match self.inner.auth.load(id).await {
            Ok(Some(stored)) => self.inner.auth.validate(&stored),
            _ => false,
        };
        warn!(
            session_id = %id,
            error = %e,
            stored_valid,
            "Failed to persist credentials"
        );
    }

    async fn on_messages(&self, id: &str, messages: Vec<WireMessage>) {
        let mut received = 0u64;
        for message in messages {
            if self.inner.options.should_ignore_jid(&message.remote_jid) {
                continue;
            }
            received += 1;
            if let Err(e) = self.inner.cache.save_json(&message.id, &message).await {
                warn!(
                    session_id = %id,
                    message_id = %message.id,
                    error = %e,
                    "Failed to cache message"
                );
            }
        }

        if received > 0 {
            self.inner.metrics.record_messages_received(id, received);
            debug!(session_id = %id, count = received, "Cached incoming messages");
        }
    }
}
