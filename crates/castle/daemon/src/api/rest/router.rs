//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let api_routes = Router::new()
        // Daemon
        .route("/health", get(handlers::health_check))
        .route("/system/shutdown", post(handlers::shutdown_daemon))
        // Local node
        .route("/registry", get(handlers::get_registry))
        .route("/status", get(handlers::node_status))
        .route("/deploy", post(handlers::run_deploy))
        // Mesh
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/:hostname", get(handlers::get_node))
        .route("/mesh/status", get(handlers::mesh_status))
        // Gateway
        .route("/gateway/routes", get(handlers::gateway_routes))
        .route("/gateway/caddyfile", get(handlers::gateway_caddyfile))
        // Events
        .route("/events/stream", get(handlers::stream_events));

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
