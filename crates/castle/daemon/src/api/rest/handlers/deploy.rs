//! Deploy handler

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::pipeline::{DeployRequest, DeploySummary};
use axum::{extract::State, Json};
use castle_deploy::DeployScope;
use castle_types::is_valid_entry_name;
use serde::Deserialize;

/// Deploy request body; every field is optional
#[derive(Debug, Default, Deserialize)]
pub struct DeployBody {
    /// Restrict the deploy to these entries
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Reload systemd and caddy; defaults to true
    #[serde(default)]
    pub apply: Option<bool>,
}

/// Run the deploy pipeline
pub async fn run_deploy(
    State(state): State<AppState>,
    body: Option<Json<DeployBody>>,
) -> ApiResult<Json<DeploySummary>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    if let Some(bad) = body.only.iter().find(|n| !is_valid_entry_name(n)) {
        return Err(ApiError::BadRequest(format!("Invalid entry name: {}", bad)));
    }
    let scope = if body.only.is_empty() {
        DeployScope::All
    } else {
        DeployScope::only(body.only)
    };

    let summary = state
        .deployer
        .deploy(DeployRequest {
            scope,
            dry_run: body.dry_run,
            apply: body.apply.unwrap_or(true),
            actor: Some("api".to_string()),
        })
        .await?;

    Ok(Json(summary))
}
