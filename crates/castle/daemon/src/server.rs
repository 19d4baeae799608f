//! Server setup and lifecycle management

use std::sync::Arc;

use castle_deploy::RegistryStore;
use castle_health::{HealthMonitor, HttpProbe};
use castle_mesh::MeshManager;
use castle_types::{CastleEvent, EventEnvelope, EventSource};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::activate::CommandActivator;
use crate::api::{create_router, AppState};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::gateway::spawn_gateway_sync;
use crate::pipeline::{build_reconciler, initial_registry, Deployer};

/// Capacity of the shared event channel; slower subscribers lag.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Castle daemon server
pub struct Server {
    config: DaemonConfig,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    /// Start every task, serve the API until a signal or a shutdown request,
    /// then stop the tasks within the grace period.
    pub async fn run(self) -> DaemonResult<()> {
        let config = self.config;
        let hostname = config.hostname();
        let addr = config.server.listen_addr;

        let (event_tx, _) = broadcast::channel::<EventEnvelope>(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = RegistryStore::new(config.paths.registry.clone());
        let registry = initial_registry(&store, &hostname)?;
        info!(
            hostname = %hostname,
            entries = registry.deployed.len(),
            "Loaded node registry"
        );
        let (registry_tx, registry_rx) = watch::channel(registry);

        let mesh = MeshManager::start(
            config.mesh.clone(),
            hostname.clone(),
            addr.port(),
            registry_rx.clone(),
            event_tx.clone(),
            shutdown_rx.clone(),
        );

        let deployer = Arc::new(Deployer::new(
            config.paths.clone(),
            build_reconciler(&config, hostname.clone()),
            registry_tx,
            mesh.handle(),
            Arc::new(CommandActivator::new(config.apply.clone())),
            event_tx.clone(),
        ));

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            Arc::new(HttpProbe::new(config.health.timeout())),
            registry_rx,
            event_tx.clone(),
        ));

        let tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            ("health", tokio::spawn(health.clone().run(shutdown_rx.clone()))),
            (
                "gateway-sync",
                spawn_gateway_sync(
                    deployer.clone(),
                    mesh.handle().watch(),
                    config.apply.caddy,
                    shutdown_rx.clone(),
                ),
            ),
        ];

        let state = AppState::new(
            deployer,
            health,
            mesh.handle(),
            event_tx.clone(),
            shutdown_tx.clone(),
        );
        let app = create_router(state, config.server.enable_cors);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DaemonError::Server(format!("failed to bind {}: {}", addr, e)))?;
        info!(addr = %addr, hostname = %hostname, "castled listening");

        let requested = shutdown_rx.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = shutdown_requested(requested) => {
                        info!("Shutdown requested over the API");
                    }
                }
            })
            .await
            .map_err(|e| DaemonError::Server(e.to_string()));

        info!("castled shutting down");
        let _ = event_tx.send(
            EventEnvelope::new(CastleEvent::ShuttingDown, EventSource::Daemon)
                .with_hostname(hostname.clone()),
        );
        let _ = shutdown_tx.send(true);

        let grace = config.shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;
        for (name, task) in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time");
                    abort.abort();
                }
            }
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        mesh.join(remaining).await;

        info!("castled stopped");
        served
    }
}

/// Resolves once the watch flips to true; never if its sender is gone.
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
