//! Daemon lifecycle

use crate::api::rest::state::AppState;
use axum::{extract::State, Json};
use castle_types::Hostname;
use serde::Serialize;
use tracing::info;

/// Acknowledgement of a shutdown request
#[derive(Debug, Serialize)]
pub struct ShutdownAck {
    pub hostname: Hostname,
    /// A previous request already started the shutdown
    pub already_requested: bool,
    pub uptime: String,
}

/// Stop serving, then give background tasks the configured grace period
pub async fn shutdown_daemon(State(state): State<AppState>) -> Json<ShutdownAck> {
    let already_requested = state.shutdown_tx.send_replace(true);
    let hostname = state.deployer.hostname().clone();
    if !already_requested {
        info!(hostname = %hostname, "Shutdown requested over the API");
    }

    Json(ShutdownAck {
        hostname,
        already_requested,
        uptime: state.uptime(),
    })
}
