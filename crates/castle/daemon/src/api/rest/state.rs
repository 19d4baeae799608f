//! Application state for API handlers

use std::sync::Arc;

use castle_health::HealthMonitor;
use castle_mesh::MeshHandle;
use castle_types::EventEnvelope;
use tokio::sync::{broadcast, watch};

use crate::pipeline::Deployer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Deploy pipeline and owner of the node registry
    pub deployer: Arc<Deployer>,

    /// Health monitor
    pub health: Arc<HealthMonitor>,

    /// Read side of the mesh
    pub mesh: MeshHandle,

    /// Event broadcast channel
    pub event_tx: broadcast::Sender<EventEnvelope>,

    /// Daemon version
    pub version: String,

    /// Daemon start time
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// Graceful shutdown signal sender
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        deployer: Arc<Deployer>,
        health: Arc<HealthMonitor>,
        mesh: MeshHandle,
        event_tx: broadcast::Sender<EventEnvelope>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            deployer,
            health,
            mesh,
            event_tx,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
            shutdown_tx,
        }
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}
