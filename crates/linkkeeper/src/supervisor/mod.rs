//! Connection supervision.
//!
//! The [`Supervisor`] owns the lifecycle of every tenant session:
//!
//! 1. `initialize` loads credentials, opens a connection through the
//!    [`Connector`] and registers the session.
//! 2. One task per connection consumes its events in order (see `lifecycle`).
//! 3. On close, the failure is classified and the recovery tracker decides
//!    between a deferred re-initialization and a terminal outcome (see `retry`).
//!
//! Every initialization advances the session's generation. Deferred work
//! captures the generation and discards itself once it is stale.

mod lifecycle;
mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use ulid::Ulid;

use linkkeeper_protocol::{ConnectionCommand, ConnectionOptions, WireMessage};

use crate::background::BackgroundTasks;
use crate::bus::{EventBus, TenantSessionUpdate};
use crate::cache::{CacheConfig, MessageCache};
use crate::config::{Config, DEFAULT_QR_MAX_ATTEMPTS, TenantConfig};
use crate::connector::{ConnectError, ConnectRequest, Connector};
use crate::metrics::{MetricsCollector, SessionMetrics};
use crate::recovery::{
    BackoffPolicy, Classifier, DEFAULT_CIRCUIT_BREAKER_THRESHOLD, ErrorCode, PolicyTable,
    RecoveryTracker,
};
use crate::session::{RegisterOutcome, SendError, SessionHandle, SessionRegistry, SessionStatus};
use crate::store::{
    AuthStore, Credentials, StorageError, TenantRecord, TenantStatus, TenantStore, TenantUpdate,
};
use crate::sync::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_IDLE_AGE, KeyedLocks};

// ============================================================================
// Types
// ============================================================================

/// External collaborators injected into the supervisor.
#[derive(Clone)]
pub struct SupervisorServices {
    pub connector: Arc<dyn Connector>,
    pub auth: Arc<dyn AuthStore>,
    pub tenants: Arc<dyn TenantStore>,
    pub bus: Arc<dyn EventBus>,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub options: ConnectionOptions,
    pub policies: PolicyTable,
    pub backoff: BackoffPolicy,
    pub circuit_breaker_threshold: u32,
    pub qr_max_attempts: u32,
    pub cache: CacheConfig,
    /// How long shutdown waits for background tasks before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            options: ConnectionOptions::default(),
            policies: PolicyTable::default(),
            backoff: BackoffPolicy::default(),
            circuit_breaker_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            qr_max_attempts: DEFAULT_QR_MAX_ATTEMPTS,
            cache: CacheConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            options: config.connection.options(),
            policies: config.recovery.policy_table(),
            backoff: config.recovery.backoff(),
            circuit_breaker_threshold: config.recovery.circuit_breaker_threshold,
            qr_max_attempts: config.recovery.qr_max_attempts,
            cache: config.cache.cache_config(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {session_id} is not open (status: {status})")]
    NotOpen {
        session_id: String,
        status: SessionStatus,
    },

    #[error("failed to send to session {session_id}: {source}")]
    Send {
        session_id: String,
        #[source]
        source: SendError,
    },

    #[error("failed to cache message: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Why a started session never reached `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionEnded {
    #[error("connection closed before opening ({0})")]
    Closed(ErrorCode),

    #[error("QR code was not scanned after {0} attempts")]
    QrAttemptsExhausted(u32),

    #[error("superseded by a newer initialization or removal")]
    Superseded,
}

/// An initialized session waiting for its connection to open.
pub struct PendingSession {
    handle: SessionHandle,
    ready: oneshot::Receiver<Result<(), SessionEnded>>,
}

impl PendingSession {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Wait until the connection opens.
    ///
    /// Fails when a close or the QR ceiling ends this initialization first.
    pub async fn opened(self) -> Result<SessionHandle, SessionEnded> {
        match self.ready.await {
            Ok(Ok(())) => Ok(self.handle),
            Ok(Err(ended)) => Err(ended),
            Err(_) => Err(SessionEnded::Superseded),
        }
    }
}

type ReadySender = oneshot::Sender<Result<(), SessionEnded>>;

// ============================================================================
// Supervisor
// ============================================================================

/// Supervises every tenant session of the process. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthStore>,
    tenants: Arc<dyn TenantStore>,
    bus: Arc<dyn EventBus>,

    registry: SessionRegistry,
    recovery: RecoveryTracker,
    classifier: Classifier,
    cache: MessageCache,
    metrics: MetricsCollector,

    options: ConnectionOptions,
    qr_max_attempts: u32,
    qr_counters: DashMap<String, u32>,
    /// Pending initializations by session id, tagged with their generation.
    pending: DashMap<String, (u64, ReadySender)>,
    locks: KeyedLocks,
    tasks: BackgroundTasks,
    shutdown_tx: watch::Sender<bool>,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(services: SupervisorServices, settings: SupervisorSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector: services.connector,
                auth: services.auth,
                tenants: services.tenants,
                bus: services.bus,
                registry: SessionRegistry::new(),
                recovery: RecoveryTracker::new(
                    settings.circuit_breaker_threshold,
                    settings.backoff,
                ),
                classifier: Classifier::new(settings.policies),
                cache: MessageCache::new(settings.cache),
                metrics: MetricsCollector::new(),
                options: settings.options,
                qr_max_attempts: settings.qr_max_attempts.max(1),
                qr_counters: DashMap::new(),
                pending: DashMap::new(),
                locks: KeyedLocks::new(),
                tasks: BackgroundTasks::new(),
                shutdown_tx,
                shutdown_grace: settings.shutdown_grace,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn recovery(&self) -> &RecoveryTracker {
        &self.inner.recovery
    }

    pub fn cache(&self) -> &MessageCache {
        &self.inner.cache
    }

    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    // ------------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------------

    /// Start supervising a tenant session.
    ///
    /// Creates the tenant record if needed, marks it `OPENING` and
    /// initializes the connection. Await [`PendingSession::opened`] to wait
    /// for the connection to open.
    pub async fn start_session(
        &self,
        tenant: &TenantConfig,
    ) -> Result<PendingSession, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        self.ensure_tenant_record(tenant).await?;
        self.update_tenant(&tenant.id, TenantUpdate::status(TenantStatus::Opening))
            .await?;

        // An explicit start supersedes any scheduled retry and restarts pairing.
        if self.inner.recovery.get(&tenant.id).is_some() {
            self.inner.recovery.set_recovery_in_progress(&tenant.id, false);
        }
        self.inner.qr_counters.remove(&tenant.id);

        match self.initialize(tenant).await {
            Ok(pending) => Ok(pending),
            Err(e) => {
                warn!(
                    session_id = %tenant.id,
                    tenant_id = %tenant.tenant_id,
                    error = %e,
                    "Failed to start session"
                );
                self.update_tenant_logged(&tenant.id, TenantUpdate::status(TenantStatus::Pending))
                    .await;
                Err(e)
            }
        }
    }

    /// Close the transport of every session of a tenant.
    ///
    /// The resulting close events drive recovery as usual. Returns the number
    /// of sessions closed.
    pub async fn restart_session(&self, tenant_id: &str) -> usize {
        let sessions = self.inner.registry.find_by_tenant(tenant_id);
        for session in &sessions {
            if let Err(e) = session.close().await {
                warn!(session_id = %session.id(), error = %e, "Failed to close session for restart");
            }
        }
        info!(tenant_id = %tenant_id, count = sessions.len(), "Restarting tenant sessions");
        sessions.len()
    }

    /// Stop supervising a session. Idempotent.
    ///
    /// Advances the generation so scheduled retries discard themselves, and
    /// marks the tenant `DISCONNECTED`. With `logout` the device is signed
    /// off first. Returns whether a live session was removed.
    pub async fn remove_session(&self, id: &str, logout: bool) -> bool {
        let lock = self.inner.locks.get(id);
        let _guard = lock.lock().await;

        self.inner.registry.advance_generation(id);
        let removed = self.inner.registry.remove(id, logout).await;
        self.inner.recovery.clear(id);
        self.inner.qr_counters.remove(id);
        self.inner.pending.remove(id);

        match self.inner.tenants.get(id).await {
            Ok(Some(_)) => {
                self.update_tenant_logged(
                    id,
                    TenantUpdate::status(TenantStatus::Disconnected).with_qr_code(""),
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => warn!(session_id = %id, error = %e, "Failed to read tenant record"),
        }

        info!(session_id = %id, logout, removed, "Removed session");
        removed
    }

    pub fn get_session(&self, id: &str) -> Option<SessionHandle> {
        self.inner.registry.find(id)
    }

    /// Metrics snapshot for one session, or all sessions with `None`.
    pub fn get_metrics(&self, id: Option<&str>) -> BTreeMap<String, SessionMetrics> {
        match id {
            Some(id) => self
                .inner
                .metrics
                .get(id)
                .map(|metrics| BTreeMap::from([(id.to_string(), metrics)]))
                .unwrap_or_default(),
            None => self.inner.metrics.snapshot(),
        }
    }

    pub fn metrics_totals(&self) -> SessionMetrics {
        self.inner.metrics.totals()
    }

    pub fn reset_metrics(&self, id: Option<&str>) {
        self.inner.metrics.reset(id);
    }

    /// Send a message through an open session.
    ///
    /// The message is cached first so the provider can ask for it again.
    /// Returns the generated message id.
    pub async fn send_message(
        &self,
        id: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<String, SupervisorError> {
        let handle = self
            .inner
            .registry
            .find(id)
            .ok_or_else(|| SupervisorError::SessionNotFound(id.to_string()))?;
        let status = handle.status();
        if status != SessionStatus::Open {
            return Err(SupervisorError::NotOpen {
                session_id: id.to_string(),
                status,
            });
        }

        let message_id = Ulid::new().to_string();
        let message = WireMessage {
            id: message_id.clone(),
            remote_jid: to.to_string(),
            from_me: true,
            timestamp: Some(Utc::now()),
            payload: payload.clone(),
        };
        self.inner.cache.save_json(&message_id, &message).await?;

        handle
            .send(ConnectionCommand::SendMessage {
                request_id: Ulid::new().to_string(),
                message_id: message_id.clone(),
                to: to.to_string(),
                payload,
            })
            .await
            .map_err(|source| SupervisorError::Send {
                session_id: id.to_string(),
                source,
            })?;

        self.inner.metrics.record_message_sent(id);
        debug!(session_id = %id, message_id = %message_id, "Sent message");
        Ok(message_id)
    }

    /// Spawn the cache sweep and lock cleanup tasks.
    pub fn start_housekeeping(&self) {
        let sweep = self
            .inner
            .cache
            .clone()
            .spawn_sweep_task(self.inner.shutdown_tx.subscribe());
        let cleanup = self.inner.locks.clone().spawn_cleanup_task(
            DEFAULT_CLEANUP_INTERVAL,
            DEFAULT_MAX_IDLE_AGE,
            self.inner.shutdown_tx.subscribe(),
        );
        self.inner.tasks.spawn(async move {
            let _ = tokio::join!(sweep, cleanup);
        });
    }

    /// Close every session and wait for background tasks.
    ///
    /// Scheduled retries are dropped.
    pub async fn shutdown(&self) {
        info!("Shutting down supervisor");
        self.inner.shutdown_tx.send_replace(true);
        self.inner.registry.shutdown().await;
        self.inner.pending.clear();
        self.inner.tasks.shutdown(self.inner.shutdown_grace).await;
    }

    // ------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------

    async fn initialize(&self, tenant: &TenantConfig) -> Result<PendingSession, SupervisorError> {
        let lock = self.inner.locks.get(&tenant.id);
        let _guard = lock.lock().await;
        self.initialize_locked(tenant).await
    }

    /// Open a new connection for `tenant`. The session lock must be held.
    async fn initialize_locked(
        &self,
        tenant: &TenantConfig,
    ) -> Result<PendingSession, SupervisorError> {
        let id = tenant.id.as_str();
        let generation = self.inner.registry.advance_generation(id);
        self.inner.metrics.record_connection_attempt(id);

        // Anything registered under an older generation is now stale.
        if let Some(stale) = self.inner.registry.find(id) {
            self.inner.registry.remove(id, false).await;
            if let Err(e) = stale.close().await {
                debug!(session_id = %id, error = %e, "Stale connection already closed");
            }
        }

        let credentials = self.load_credentials(id).await?;
        let has_credentials = credentials.is_some();
        let connection = self
            .inner
            .connector
            .connect(ConnectRequest {
                session_id: id.to_string(),
                tenant_id: tenant.tenant_id.clone(),
                credentials,
                options: self.inner.options.clone(),
                messages: self.inner.cache.clone(),
            })
            .await?;

        let handle = SessionHandle::new(id, &tenant.tenant_id, generation, connection.commands);
        if let RegisterOutcome::Replaced(old) = self.inner.registry.register(handle.clone())
            && let Err(e) = old.close().await
        {
            debug!(session_id = %id, error = %e, "Replaced connection already closed");
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.inner
            .pending
            .insert(id.to_string(), (generation, ready_tx));

        let supervisor = self.clone();
        let events_tenant = tenant.clone();
        let events_handle = handle.clone();
        let events = connection.events;
        self.inner.tasks.spawn(async move {
            supervisor
                .run_events(events_tenant, events_handle, events)
                .await;
        });

        info!(
            session_id = %id,
            tenant_id = %tenant.tenant_id,
            generation,
            has_credentials,
            "Initialized session"
        );
        Ok(PendingSession {
            handle,
            ready: ready_rx,
        })
    }

    /// Load stored credentials, discarding ones that fail validation.
    async fn load_credentials(&self, id: &str) -> Result<Option<Credentials>, StorageError> {
        let stored = match self.inner.auth.load(id).await {
            Ok(stored) => stored,
            Err(StorageError::FileDeserialization { path, message }) => {
                warn!(
                    session_id = %id,
                    path = %path.display(),
                    error = %message,
                    "Stored credentials are unreadable, starting fresh"
                );
                self.inner.auth.clear(id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match stored {
            Some(credentials) if self.inner.auth.validate(&credentials) => Ok(Some(credentials)),
            Some(_) => {
                warn!(session_id = %id, "Stored credentials failed validation, starting fresh");
                self.inner.auth.clear(id).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Tenant Records
    // ------------------------------------------------------------------------

    async fn ensure_tenant_record(&self, tenant: &TenantConfig) -> Result<(), StorageError> {
        if self.inner.tenants.get(&tenant.id).await?.is_none() {
            let name = if tenant.name.is_empty() {
                tenant.id.clone()
            } else {
                tenant.name.clone()
            };
            let record = TenantRecord::new(&tenant.id, &tenant.tenant_id, name);
            self.inner.tenants.put(&record).await?;
            debug!(session_id = %tenant.id, "Created tenant record");
        }
        Ok(())
    }

    /// Update a tenant record and publish the result.
    async fn update_tenant(
        &self,
        id: &str,
        update: TenantUpdate,
    ) -> Result<TenantRecord, StorageError> {
        let record = self.inner.tenants.update(id, &update).await?;
        self.inner
            .bus
            .publish(TenantSessionUpdate::update(record.clone()))
            .await;
        Ok(record)
    }

    /// Like [`update_tenant`](Self::update_tenant), logging failures.
    async fn update_tenant_logged(&self, id: &str, update: TenantUpdate) {
        if let Err(e) = self.update_tenant(id, update).await {
            warn!(session_id = %id, error = %e, "Failed to update tenant record");
        }
    }

    fn resolve_pending(&self, id: &str, generation: u64, result: Result<(), SessionEnded>) {
        if let Some((_, (_, ready))) = self
            .inner
            .pending
            .remove_if(id, |_, (pending_generation, _)| *pending_generation == generation)
        {
            // The caller may have dropped its PendingSession.
            let _ = ready.send(result);
        }
    }
}

/// Resolves once shutdown has been requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
