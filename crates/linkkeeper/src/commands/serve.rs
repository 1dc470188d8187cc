//! `linkkeeper serve`: supervise the configured tenants until interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::join_all;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use linkkeeper::bus::{BroadcastEventBus, TenantSessionUpdate};
use linkkeeper::config::{self, Config};
use linkkeeper::connector::SubprocessConnector;
use linkkeeper::store::file::{FileAuthStore, FileTenantStore};
use linkkeeper::supervisor::{Supervisor, SupervisorServices, SupervisorSettings};

/// How often a metrics summary is logged.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(300);

pub async fn run(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).await?;
    if config.tenants.is_empty() {
        bail!("No tenants configured in '{config_path}'");
    }
    if config.connector.command.is_empty() {
        bail!("No protocol bridge configured (set connector.command in '{config_path}')");
    }

    let workspace = config.workspace_dir(Path::new(config_path));
    let auth_dir = workspace.join(config::DEFAULT_AUTH_DIR);
    let tenants_dir = workspace.join(config::DEFAULT_TENANTS_DIR);
    info!(
        workspace = %workspace.display(),
        tenants = config.tenants.len(),
        "Starting supervisor"
    );

    let bus = Arc::new(BroadcastEventBus::default());
    let updates = bus.subscribe();
    let services = SupervisorServices {
        connector: Arc::new(SubprocessConnector::new(config.connector.clone())),
        auth: Arc::new(FileAuthStore::new(&auth_dir)),
        tenants: Arc::new(FileTenantStore::new(&tenants_dir)),
        bus,
    };
    let supervisor = Supervisor::new(services, SupervisorSettings::from_config(&config));
    supervisor.start_housekeeping();

    let update_logger = tokio::spawn(log_updates(updates));

    let started = join_all(
        config
            .tenants
            .iter()
            .map(|tenant| supervisor.start_session(tenant)),
    )
    .await;
    for (tenant, result) in config.tenants.iter().zip(started) {
        match result {
            Ok(pending) => {
                let session_id = tenant.id.clone();
                tokio::spawn(async move {
                    match pending.opened().await {
                        Ok(_) => debug!(session_id = %session_id, "Initial connection opened"),
                        Err(e) => warn!(session_id = %session_id, error = %e, "Initial connection did not open"),
                    }
                });
            }
            Err(e) => warn!(session_id = %tenant.id, error = %e, "Failed to start tenant session"),
        }
    }

    let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
    ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_metrics(&supervisor).await,
            _ = &mut shutdown => break,
        }
    }

    supervisor.shutdown().await;
    update_logger.abort();
    info!("Supervisor stopped");
    Ok(())
}

async fn log_metrics(supervisor: &Supervisor) {
    let totals = supervisor.metrics_totals();
    let cache = supervisor.cache().stats().await;
    info!(
        sessions = supervisor.registry().len(),
        connection_attempts = totals.connection_attempts,
        successful_connections = totals.successful_connections,
        failed_connections = totals.failed_connections,
        reconnections = totals.reconnections,
        messages_received = totals.messages_received,
        messages_sent = totals.messages_sent,
        cache_hot = cache.hot_entries,
        cache_cold = cache.cold_entries,
        "Metrics summary"
    );
}

async fn log_updates(mut updates: broadcast::Receiver<TenantSessionUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => info!(
                session_id = %update.record.id,
                tenant_id = %update.record.tenant_id,
                status = %update.record.status,
                "Tenant session updated"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Tenant update log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
