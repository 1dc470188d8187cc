//! Common test utilities.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use linkkeeper::bus::{BroadcastEventBus, TenantSessionUpdate};
use linkkeeper::config::TenantConfig;
use linkkeeper::connector::{
    CHANNEL_CAPACITY, ConnectError, ConnectRequest, Connection, Connector,
};
use linkkeeper::store::file::{FileAuthStore, FileTenantStore};
use linkkeeper::store::{
    AuthStore, Credentials, StorageError, StorageResult, TenantRecord, TenantStatus, TenantStore,
    TenantUpdate,
};
use linkkeeper::supervisor::{Supervisor, SupervisorServices, SupervisorSettings};
use linkkeeper_protocol::{ConnectionCommand, ConnectionEvent, DisconnectReason, Failure};

/// Upper bound for waiting on something that is expected to happen.
pub const EXPECT_WITHIN: Duration = Duration::from_secs(600);

// ============================================================================
// Scripted Connector
// ============================================================================

/// One connection opened by the supervisor, driven by the test.
pub struct ScriptedConnection {
    pub request: ConnectRequest,
    pub events: mpsc::Sender<ConnectionEvent>,
    pub commands: mpsc::Receiver<ConnectionCommand>,
}

impl ScriptedConnection {
    pub async fn emit(&self, event: ConnectionEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn qr(&self, code: &str) {
        self.emit(ConnectionEvent::Qr {
            code: code.to_string(),
        })
        .await;
    }

    pub async fn open(&self, number: &str) {
        self.emit(ConnectionEvent::Open {
            number: Some(number.to_string()),
        })
        .await;
    }

    pub async fn close(&self, reason: DisconnectReason) {
        self.emit(ConnectionEvent::Close {
            failure: Failure::protocol(reason),
        })
        .await;
    }

    pub async fn next_command(&mut self) -> ConnectionCommand {
        tokio::time::timeout(EXPECT_WITHIN, self.commands.recv())
            .await
            .expect("timed out waiting for command")
            .expect("command channel closed")
    }
}

/// Hands every connection to the test through a channel.
pub struct ScriptedConnector {
    connections: mpsc::UnboundedSender<ScriptedConnection>,
    attempts: AtomicUsize,
    reject: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: tx,
                attempts: AtomicUsize::new(0),
                reject: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent connection attempts fail.
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(ConnectError::Rejected("scripted rejection".to_string()));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let _ = self.connections.send(ScriptedConnection {
            request,
            events: evt_tx,
            commands: cmd_rx,
        });
        Ok(Connection {
            commands: cmd_tx,
            events: evt_rx,
        })
    }
}

// ============================================================================
// Failing Stores
// ============================================================================

fn injected_failure(id: &str) -> StorageError {
    StorageError::file_io(id, std::io::Error::other("injected write failure"))
}

/// File-backed credential store whose writes can be made to fail.
pub struct FailingAuthStore {
    inner: FileAuthStore,
    fail_writes: AtomicBool,
}

impl FailingAuthStore {
    pub fn new(inner: FileAuthStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, id: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected_failure(id));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthStore for FailingAuthStore {
    async fn load(&self, session_id: &str) -> StorageResult<Option<Credentials>> {
        self.inner.load(session_id).await
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> StorageResult<()> {
        self.check(session_id)?;
        self.inner.save(session_id, credentials).await
    }

    async fn clear(&self, session_id: &str) -> StorageResult<()> {
        self.check(session_id)?;
        self.inner.clear(session_id).await
    }
}

/// File-backed tenant store whose writes can be made to fail.
pub struct FailingTenantStore {
    inner: FileTenantStore,
    fail_writes: AtomicBool,
}

impl FailingTenantStore {
    pub fn new(inner: FileTenantStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, id: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected_failure(id));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for FailingTenantStore {
    async fn get(&self, id: &str) -> StorageResult<Option<TenantRecord>> {
        self.inner.get(id).await
    }

    async fn put(&self, record: &TenantRecord) -> StorageResult<()> {
        self.check(&record.id)?;
        self.inner.put(record).await
    }

    async fn update(&self, id: &str, update: &TenantUpdate) -> StorageResult<TenantRecord> {
        self.check(id)?;
        self.inner.update(id, update).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub supervisor: Supervisor,
    pub connector: Arc<ScriptedConnector>,
    pub connections: mpsc::UnboundedReceiver<ScriptedConnection>,
    pub auth: Arc<FailingAuthStore>,
    pub tenants: Arc<FailingTenantStore>,
    pub updates: broadcast::Receiver<TenantSessionUpdate>,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SupervisorSettings::default())
    }

    pub fn with_settings(settings: SupervisorSettings) -> Self {
        let tmp = TempDir::new().unwrap();
        let (connector, connections) = ScriptedConnector::new();
        let connector = Arc::new(connector);
        let auth = Arc::new(FailingAuthStore::new(FileAuthStore::new(
            tmp.path().join("auth"),
        )));
        let tenants = Arc::new(FailingTenantStore::new(FileTenantStore::new(
            tmp.path().join("tenants"),
        )));
        let bus = Arc::new(BroadcastEventBus::new(1024));
        let updates = bus.subscribe();

        let supervisor = Supervisor::new(
            SupervisorServices {
                connector: connector.clone(),
                auth: auth.clone(),
                tenants: tenants.clone(),
                bus,
            },
            settings,
        );

        Self {
            supervisor,
            connector,
            connections,
            auth,
            tenants,
            updates,
            _tmp: tmp,
        }
    }

    pub async fn next_connection(&mut self) -> ScriptedConnection {
        tokio::time::timeout(EXPECT_WITHIN, self.connections.recv())
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("connector dropped")
    }

    /// Assert that no connection attempt happens within `window`.
    pub async fn expect_no_connection(&mut self, window: Duration) {
        if let Ok(Some(connection)) =
            tokio::time::timeout(window, self.connections.recv()).await
        {
            panic!(
                "unexpected connection attempt for {}",
                connection.request.session_id
            );
        }
    }

    /// Wait until a published update puts `id` into `status`.
    pub async fn wait_for_status(&mut self, id: &str, status: TenantStatus) -> TenantRecord {
        tokio::time::timeout(EXPECT_WITHIN, async {
            loop {
                let update = self.updates.recv().await.unwrap();
                if update.record.id == id && update.record.status == status {
                    return update.record;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {id} to become {status}"))
    }

    pub async fn tenant(&self, id: &str) -> TenantRecord {
        self.tenants.get(id).await.unwrap().expect("tenant record")
    }

    pub async fn seed_credentials(&self, id: &str, value: serde_json::Value) {
        self.auth.save(id, &Credentials::new(value)).await.unwrap();
    }
}

pub fn tenant(id: &str) -> TenantConfig {
    TenantConfig::new(id, "tenant-1", format!("{id} line"))
}

/// Poll `condition` until it holds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
