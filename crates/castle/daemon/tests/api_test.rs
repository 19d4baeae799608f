//! REST API tests against an in-process router.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use castle_daemon::api::{create_router, AppState};
use castle_daemon::config::PathsConfig;
use castle_daemon::{Deployer, NoopActivator};
use castle_deploy::{MemorySecretStore, Reconciler, ReconcilerConfig, StaticResolver};
use castle_health::{HealthConfig, HealthMonitor, HttpProbe};
use castle_mesh::{MeshConfig, MeshHandle};
use castle_types::{Hostname, NodeConfig, NodeRegistry};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tower::ServiceExt;

const SPEC: &str = r#"
node:
  gateway_port: 9000
services:
  notes:
    run: { runner: command, argv: [notes-server] }
    expose:
      http:
        internal: { port: 9001 }
        health_path: /health
    proxy: { caddy: { path_prefix: /notes } }
    manage: { systemd: {} }
"#;

struct TestApp {
    _dir: tempfile::TempDir,
    router: Router,
    shutdown_rx: watch::Receiver<bool>,
}

fn app_with_spec(spec: &str) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let paths = paths_in(root);
    std::fs::write(&paths.spec, spec).unwrap();

    let hostname = Hostname::new("tower");
    let reconciler = Reconciler::new(
        ReconcilerConfig::new(hostname.clone()),
        Arc::new(MemorySecretStore::new()),
        Arc::new(StaticResolver::new().with("notes-server", "/usr/bin/notes-server")),
    );
    let (registry_tx, registry_rx) = watch::channel(NodeRegistry::empty(NodeConfig {
        hostname: hostname.clone(),
        gateway_port: 9000,
        static_root: None,
    }));
    let (event_tx, _) = broadcast::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mesh = MeshHandle::disabled(hostname, &MeshConfig::default());

    let deployer = Arc::new(Deployer::new(
        paths,
        reconciler,
        registry_tx,
        mesh.clone(),
        Arc::new(NoopActivator),
        event_tx.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(
        HealthConfig::default(),
        Arc::new(HttpProbe::default()),
        registry_rx,
        event_tx.clone(),
    ));

    let state = AppState::new(deployer, health, mesh, event_tx, shutdown_tx);
    TestApp {
        _dir: dir,
        router: create_router(state, true),
        shutdown_rx,
    }
}

fn paths_in(root: &Path) -> PathsConfig {
    PathsConfig {
        spec: root.join("castle.yaml"),
        registry: root.join("registry.yaml"),
        secrets_dir: root.join("secrets"),
        units_dir: root.join("units"),
        caddyfile: root.join("Caddyfile"),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_deploy(router: &Router, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/deploy")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_endpoint_reports_hostname() {
    let app = app_with_spec(SPEC);
    let (status, json) = get_json(&app.router, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["hostname"], "tower");
}

#[tokio::test]
async fn deploy_then_read_registry_and_gateway() {
    let app = app_with_spec(SPEC);

    let (status, summary) = post_deploy(&app.router, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["report"]["deployed"], serde_json::json!(["notes"]));
    assert_eq!(summary["dry_run"], false);

    let (status, registry) = get_json(&app.router, "/api/v1/registry").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry["deployed"]["notes"]["port"], 9001);

    let (status, routes) = get_json(&app.router, "/api/v1/gateway/routes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(routes["routes"][0]["path_prefix"], "/notes");
    assert_eq!(routes["routes"][0]["port"], 9001);

    let request = Request::builder()
        .uri("/api/v1/gateway/caddyfile")
        .body(Body::empty())
        .unwrap();
    let (status, text) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains(":9000 {"));
    assert!(text.contains("handle_path /notes/* {"));
}

#[tokio::test]
async fn status_lists_unprobed_entries_as_unknown() {
    let app = app_with_spec(SPEC);
    post_deploy(&app.router, serde_json::json!({})).await;

    let (status, json) = get_json(&app.router, "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["unknown"], 1);
    assert_eq!(json["statuses"][0]["name"], "notes");
    assert_eq!(json["statuses"][0]["status"], "unknown");
}

#[tokio::test]
async fn nodes_include_local_and_unknown_node_is_404() {
    let app = app_with_spec(SPEC);
    post_deploy(&app.router, serde_json::json!({})).await;

    let (status, nodes) = get_json(&app.router, "/api/v1/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nodes.as_array().unwrap().len(), 1);
    assert_eq!(nodes[0]["hostname"], "tower");
    assert_eq!(nodes[0]["local"], true);
    assert_eq!(nodes[0]["entries"], 1);

    let (status, node) = get_json(&app.router, "/api/v1/nodes/tower").await;
    assert_eq!(status, StatusCode::OK);
    assert!(node["registry"]["deployed"]["notes"].get("env").is_none());

    let (status, error) = get_json(&app.router, "/api/v1/nodes/attic").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["code"], "NOT_FOUND");
}

#[tokio::test]
async fn mesh_status_reports_disabled() {
    let app = app_with_spec(SPEC);
    let (status, json) = get_json(&app.router, "/api/v1/mesh/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);
    assert_eq!(json["peers"], 0);
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let app = app_with_spec(SPEC);
    let (status, summary) = post_deploy(&app.router, serde_json::json!({"dry_run": true})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["dry_run"], true);

    let (_, registry) = get_json(&app.router, "/api/v1/registry").await;
    assert!(registry["deployed"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_spec_is_unprocessable() {
    let app = app_with_spec("services:\n  Bad_Name:\n    run: { runner: command, argv: [x] }\n");
    let (status, error) = post_deploy(&app.router, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn invalid_entry_name_in_scope_is_bad_request() {
    let app = app_with_spec(SPEC);
    let (status, error) = post_deploy(&app.router, serde_json::json!({"only": ["../etc"]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["code"], "BAD_REQUEST");
}

async fn post_shutdown(router: &Router) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/system/shutdown")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn shutdown_request_flips_the_watch() {
    let mut app = app_with_spec(SPEC);
    let (status, ack) = post_shutdown(&app.router).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["hostname"], "tower");
    assert_eq!(ack["already_requested"], false);
    assert!(app.shutdown_rx.has_changed().unwrap());
    assert!(*app.shutdown_rx.borrow_and_update());

    let (status, ack) = post_shutdown(&app.router).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["already_requested"], true);
}
