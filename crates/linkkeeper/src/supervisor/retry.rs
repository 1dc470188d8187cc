//! Close handling and deferred re-initialization.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use linkkeeper_protocol::Failure;

use crate::config::TenantConfig;
use crate::recovery::{ErrorClassification, GiveUpReason, RecoveryDecision, RecoveryStrategy};
use crate::session::{SessionHandle, SessionStatus};
use crate::store::{TenantStatus, TenantUpdate};

use super::{SessionEnded, Supervisor, SupervisorError};

impl Supervisor {
    pub(super) async fn on_close(
        &self,
        tenant: &TenantConfig,
        handle: &SessionHandle,
        failure: Failure,
    ) {
        let id = handle.id();
        handle.set_status(SessionStatus::Closed);

        let classification = self.inner.classifier.classify(&failure);
        self.inner.metrics.record_failure(id, classification.code);
        self.resolve_pending(
            id,
            handle.generation(),
            Err(SessionEnded::Closed(classification.code)),
        );

        match self.inner.recovery.decide(id, &classification) {
            RecoveryDecision::GiveUp {
                reason: GiveUpReason::RecoveryInProgress,
            } => {
                debug!(
                    session_id = %id,
                    code = %classification.code,
                    "Recovery already scheduled, ignoring close"
                );
            }
            RecoveryDecision::GiveUp { reason } => {
                warn!(
                    session_id = %id,
                    tenant_id = %tenant.tenant_id,
                    code = %classification.code,
                    reason = reason.as_str(),
                    failure = %failure,
                    "Connection closed, giving up"
                );
                self.terminate(id).await;
            }
            RecoveryDecision::Retry {
                strategy,
                attempt,
                delay,
            } => {
                warn!(
                    session_id = %id,
                    tenant_id = %tenant.tenant_id,
                    code = %classification.code,
                    strategy = %strategy,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    failure = %failure,
                    "Connection closed, recovering"
                );
                self.inner.recovery.set_recovery_in_progress(id, true);

                if let Err(e) = self
                    .dispatch_recovery(tenant, &classification, strategy, attempt, delay)
                    .await
                {
                    error!(
                        session_id = %id,
                        tenant_id = %tenant.tenant_id,
                        code = %classification.code,
                        strategy = %strategy,
                        error = %e,
                        "Recovery failed"
                    );
                    self.inner.recovery.set_recovery_in_progress(id, false);
                    self.inner.registry.remove(id, false).await;
                    self.inner.recovery.clear(id);
                }
            }
        }
    }

    async fn dispatch_recovery(
        &self,
        tenant: &TenantConfig,
        classification: &ErrorClassification,
        strategy: RecoveryStrategy,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), SupervisorError> {
        let id = tenant.id.as_str();
        match strategy {
            RecoveryStrategy::ClearCredentials => {
                self.inner.auth.clear(id).await?;
                self.update_tenant(
                    id,
                    TenantUpdate::status(TenantStatus::Pending).with_qr_code(""),
                )
                .await?;
                self.inner.registry.remove(id, false).await;
                info!(session_id = %id, "Cleared credentials, pairing again");
                self.schedule_retry(tenant, attempt, delay);
            }
            RecoveryStrategy::Reconnect | RecoveryStrategy::Retry => {
                self.inner.registry.remove(id, false).await;
                self.schedule_retry(tenant, attempt, delay);
            }
            RecoveryStrategy::RestartSession => {
                self.update_tenant(id, TenantUpdate::status(TenantStatus::Pending))
                    .await?;
                self.inner.registry.remove(id, false).await;
                self.schedule_retry(tenant, attempt, delay);
            }
            RecoveryStrategy::ManualIntervention => {
                self.update_tenant(
                    id,
                    TenantUpdate::status(TenantStatus::Pending).increment_retries(),
                )
                .await?;
                self.inner.registry.remove(id, false).await;
                self.inner.recovery.clear(id);
                warn!(
                    session_id = %id,
                    code = %classification.code,
                    "{}, operator action required",
                    classification.description
                );
            }
            RecoveryStrategy::NoRecovery => {
                self.inner.registry.remove(id, false).await;
                self.inner.recovery.clear(id);
                warn!(
                    session_id = %id,
                    code = %classification.code,
                    "{}, not recovering",
                    classification.description
                );
            }
        }
        Ok(())
    }

    /// Give up on a session: detach it and mark the tenant `PENDING`.
    async fn terminate(&self, id: &str) {
        self.inner.registry.remove(id, false).await;
        self.inner.recovery.clear(id);
        self.inner.qr_counters.remove(id);
        self.update_tenant_logged(id, TenantUpdate::status(TenantStatus::Pending))
            .await;
    }

    // ========================================================================
    // Deferred Retries
    // ========================================================================

    /// Re-initialize `tenant` after `delay` unless the session moves on first.
    fn schedule_retry(&self, tenant: &TenantConfig, attempt: u32, delay: Duration) {
        if self.is_shutting_down() {
            debug!(session_id = %tenant.id, "Not scheduling retry during shutdown");
            return;
        }

        let generation = self.inner.registry.generation(&tenant.id);
        let supervisor = self.clone();
        let tenant = tenant.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    supervisor.run_scheduled_retry(tenant, generation, attempt).await;
                }
                _ = super::shutdown_requested(&mut shutdown) => {
                    debug!(session_id = %tenant.id, "Dropped scheduled retry on shutdown");
                }
            }
        });
    }

    /// Boxed to break the type cycle between initialization and retries.
    fn run_scheduled_retry(
        self,
        tenant: TenantConfig,
        generation: u64,
        attempt: u32,
    ) -> BoxFuture<'static, ()> {
        async move {
            let id = tenant.id.as_str();
            let lock = self.inner.locks.get(id);
            let _guard = lock.lock().await;

            if !self.inner.registry.is_current(id, generation) {
                debug!(session_id = %id, generation, "Discarding stale retry");
                return;
            }
            if self.inner.registry.find(id).is_some() {
                debug!(session_id = %id, "Session is live again, discarding retry");
                return;
            }
            match self.inner.tenants.get(id).await {
                Ok(Some(record)) if record.status != TenantStatus::Disconnected => {}
                Ok(_) => {
                    debug!(session_id = %id, "Tenant disconnected, discarding retry");
                    self.inner.recovery.clear(id);
                    return;
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to read tenant record, discarding retry");
                    self.inner.recovery.clear(id);
                    return;
                }
            }

            self.inner.recovery.set_recovery_in_progress(id, false);
            self.inner.metrics.record_reconnection(id);
            info!(session_id = %id, attempt, "Re-initializing session");

            if let Err(e) = self.initialize_locked(&tenant).await {
                error!(
                    session_id = %id,
                    tenant_id = %tenant.tenant_id,
                    attempt,
                    error = %e,
                    "Re-initialization failed"
                );
                self.terminate(id).await;
            }
        }
        .boxed()
    }
}
