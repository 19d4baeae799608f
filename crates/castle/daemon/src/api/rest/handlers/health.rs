//! Health and status handlers

use crate::api::rest::state::AppState;
use axum::{extract::State, Json};
use castle_types::{HealthState, HealthStatus, Hostname};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub hostname: Hostname,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        hostname: state.deployer.hostname().clone(),
    })
}

/// Entry health on this node
#[derive(Debug, Serialize)]
pub struct NodeStatusResponse {
    pub hostname: Hostname,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub up: usize,
    pub down: usize,
    pub unknown: usize,
    pub statuses: Vec<HealthStatus>,
}

/// Last known health of every deployed entry
///
/// Entries deployed since the last monitor tick are reported as unknown.
pub async fn node_status(State(state): State<AppState>) -> Json<NodeStatusResponse> {
    let registry = state.deployer.registry();
    let snapshot = state.health.snapshot();

    let statuses: Vec<HealthStatus> = registry
        .deployed
        .keys()
        .map(|name| {
            snapshot
                .get(name)
                .cloned()
                .unwrap_or_else(|| HealthStatus::unknown(name.clone()))
        })
        .collect();
    let count = |s: HealthState| statuses.iter().filter(|h| h.status == s).count();

    Json(NodeStatusResponse {
        hostname: registry.node.hostname.clone(),
        timestamp: snapshot.timestamp,
        up: count(HealthState::Up),
        down: count(HealthState::Down),
        unknown: count(HealthState::Unknown),
        statuses,
    })
}
