//! Gateway handlers

use crate::api::rest::state::AppState;
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use castle_generators::RouteTable;

/// Merged route table, including dropped remote routes
pub async fn gateway_routes(State(state): State<AppState>) -> Json<RouteTable> {
    Json(state.deployer.caddyfile().table)
}

/// The Caddyfile as it would be generated now
pub async fn gateway_caddyfile(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.deployer.caddyfile().text,
    )
}
