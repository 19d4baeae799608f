//! Registry and mesh membership handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    Json,
};
use castle_mesh::MeshStatus;
use castle_types::{Hostname, NodeRegistry, PublicRegistry};
use serde::Serialize;

/// The full local registry
pub async fn get_registry(State(state): State<AppState>) -> Json<NodeRegistry> {
    Json(state.deployer.registry())
}

/// One row of the node list
#[derive(Debug, Serialize)]
pub struct NodeSummary {
    pub hostname: Hostname,
    pub local: bool,
    pub online: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<i64>,
}

/// This node followed by every fresh peer, in hostname order
pub async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeSummary>> {
    let registry = state.deployer.registry();
    let snapshot = state.mesh.snapshot();
    let now = chrono::Utc::now();

    let local = NodeSummary {
        hostname: registry.node.hostname.clone(),
        local: true,
        online: true,
        entries: registry.deployed.len(),
        received_at: None,
        age_secs: None,
    };
    let peers = snapshot.remotes().map(|remote| NodeSummary {
        hostname: remote.hostname.clone(),
        local: false,
        online: remote.online,
        entries: remote.registry.deployed.len(),
        received_at: Some(remote.received_at),
        age_secs: Some(remote.age(now).num_seconds()),
    });

    Json(std::iter::once(local).chain(peers).collect())
}

/// A node's published registry
#[derive(Debug, Serialize)]
pub struct NodeDetail {
    pub hostname: Hostname,
    pub local: bool,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    pub registry: PublicRegistry,
}

/// Registry of one node, local or remote
pub async fn get_node(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> ApiResult<Json<NodeDetail>> {
    let registry = state.deployer.registry();
    if registry.node.hostname.as_str() == hostname {
        return Ok(Json(NodeDetail {
            hostname: registry.node.hostname.clone(),
            local: true,
            online: true,
            received_at: None,
            registry: registry.public_view(),
        }));
    }

    let snapshot = state.mesh.snapshot();
    let remote = snapshot
        .get(&hostname)
        .ok_or_else(|| ApiError::NotFound(format!("Node {} not found", hostname)))?;

    Ok(Json(NodeDetail {
        hostname: remote.hostname.clone(),
        local: false,
        online: remote.online,
        received_at: Some(remote.received_at),
        registry: remote.registry.clone(),
    }))
}

/// Broker connection and peer counts
pub async fn mesh_status(State(state): State<AppState>) -> Json<MeshStatus> {
    Json(state.mesh.status())
}
