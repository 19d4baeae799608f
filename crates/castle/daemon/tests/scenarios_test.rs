//! End-to-end behaviour across the deploy pipeline, the health monitor, the
//! mesh state and the gateway generator.

use std::collections::BTreeMap;
use std::sync::Arc;

use castle_daemon::config::PathsConfig;
use castle_daemon::{DeployRequest, Deployer, NoopActivator};
use castle_deploy::{MemorySecretStore, Reconciler, ReconcilerConfig, StaticResolver};
use castle_generators::route_table;
use castle_health::{HealthConfig, HealthMonitor, HttpProbe};
use castle_mesh::{Inbound, MeshConfig, MeshHandle, MeshState};
use castle_types::{
    DeployedEntry, EntryKind, HealthState, Hostname, NodeConfig, NodeRegistry, RunnerKind,
};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, watch};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(port: u16, prefix: &str) -> DeployedEntry {
    DeployedEntry {
        kind: EntryKind::Service,
        runner: RunnerKind::Command,
        description: None,
        run_cmd: vec!["/usr/bin/x".into()],
        env: BTreeMap::new(),
        host: Some("127.0.0.1".into()),
        port: Some(port),
        health_path: Some("/health".into()),
        proxy_path: Some(prefix.into()),
        remote: None,
        schedule: None,
        timezone: None,
        managed: true,
        supervision: None,
    }
}

/// A service listening on every interface, reachable from other nodes.
fn shared(port: u16, prefix: &str) -> DeployedEntry {
    DeployedEntry {
        host: Some("0.0.0.0".into()),
        ..service(port, prefix)
    }
}

fn registry(hostname: &str, entries: &[(&str, DeployedEntry)]) -> NodeRegistry {
    NodeRegistry {
        node: NodeConfig {
            hostname: Hostname::new(hostname),
            gateway_port: 9000,
            static_root: None,
        },
        deployed: entries
            .iter()
            .map(|(name, entry)| (name.to_string(), entry.clone()))
            .collect(),
    }
}

#[tokio::test]
async fn single_service_is_deployed_routed_and_probed_up() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;
    let port = upstream.address().port();

    let dir = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        spec: dir.path().join("castle.yaml"),
        registry: dir.path().join("registry.yaml"),
        secrets_dir: dir.path().join("secrets"),
        units_dir: dir.path().join("units"),
        caddyfile: dir.path().join("Caddyfile"),
    };
    std::fs::write(
        &paths.spec,
        format!(
            r#"
services:
  svc:
    run: {{ runner: command, argv: [svc-server] }}
    expose:
      http:
        internal: {{ port: {port} }}
        health_path: /health
    proxy: {{ caddy: {{ path_prefix: /svc }} }}
    manage: {{ systemd: {{}} }}
"#
        ),
    )
    .unwrap();

    let hostname = Hostname::new("a");
    let (registry_tx, registry_rx) = watch::channel(NodeRegistry::empty(NodeConfig {
        hostname: hostname.clone(),
        gateway_port: 9000,
        static_root: None,
    }));
    let (event_tx, _) = broadcast::channel(64);
    let deployer = Deployer::new(
        paths.clone(),
        Reconciler::new(
            ReconcilerConfig::new(hostname.clone()),
            Arc::new(MemorySecretStore::new()),
            Arc::new(StaticResolver::new().with("svc-server", "/usr/bin/svc-server")),
        ),
        registry_tx,
        MeshHandle::disabled(hostname, &MeshConfig::default()),
        Arc::new(NoopActivator),
        event_tx.clone(),
    );

    let summary = deployer.deploy(DeployRequest::default()).await.unwrap();
    assert_eq!(summary.report.deployed, vec!["svc"]);

    let deployed = deployer.registry();
    assert_eq!(deployed.deployed.len(), 1);
    assert_eq!(deployed.get("svc").unwrap().port, Some(port));

    let caddyfile = std::fs::read_to_string(&paths.caddyfile).unwrap();
    assert!(caddyfile.contains("handle_path /svc/* {"));
    assert!(caddyfile.contains(&format!("reverse_proxy 127.0.0.1:{}", port)));

    let monitor = HealthMonitor::new(
        HealthConfig::default(),
        Arc::new(HttpProbe::default()),
        registry_rx,
        event_tx,
    );
    let snapshot = monitor.tick().await;
    assert_eq!(snapshot.get("svc").unwrap().status, HealthState::Up);
}

#[test]
fn local_route_wins_over_remote_with_same_prefix() {
    let local = registry("a", &[("x", service(9001, "/x"))]);
    let remote = registry(
        "b",
        &[("x", shared(9002, "/x")), ("y", shared(9003, "/y"))],
    );

    let mut mesh = MeshState::new(Hostname::new("a"), ChronoDuration::seconds(300));
    let now = Utc::now();
    mesh.apply(
        Inbound::Registry {
            hostname: Hostname::new("b"),
            registry: remote.public_view(),
        },
        now,
    );
    let snapshot = mesh.snapshot(now);
    assert!(snapshot.get("b").is_some());

    let table = route_table(&local, snapshot.remotes());
    let x = table.find("/x").unwrap();
    assert!(x.local);
    assert_eq!(x.port, 9001);
    assert_eq!(x.host, "127.0.0.1");

    let y = table.find("/y").unwrap();
    assert!(!y.local);
    assert_eq!(y.host, "b");
    assert_eq!(y.port, 9003);

    assert_eq!(table.warnings.len(), 1);
    assert_eq!(table.warnings[0].dropped, Hostname::new("b"));
}

#[test]
fn silent_peer_expires_and_its_routes_are_withdrawn() {
    let local = registry("a", &[("x", service(9001, "/x"))]);
    let remote = registry("b", &[("y", shared(9003, "/y"))]);

    let mut mesh = MeshState::new(Hostname::new("a"), ChronoDuration::seconds(300));
    let t0 = Utc::now();
    mesh.apply(
        Inbound::Registry {
            hostname: Hostname::new("b"),
            registry: remote.public_view(),
        },
        t0,
    );
    assert!(route_table(&local, mesh.snapshot(t0).remotes())
        .find("/y")
        .is_some());

    // no offline marker ever arrives
    let later = t0 + ChronoDuration::seconds(301);
    assert!(mesh.snapshot(later).get("b").is_none());
    assert_eq!(mesh.expire_stale(later), vec![Hostname::new("b")]);
    assert!(mesh.is_empty());

    let table = route_table(&local, mesh.snapshot(later).remotes());
    assert!(table.find("/y").is_none());
    assert!(table.find("/x").is_some());
}

#[test]
fn peer_service_bound_to_loopback_is_not_routed() {
    let local = registry("a", &[("x", service(9001, "/x"))]);
    let remote = registry(
        "b",
        &[("private", service(9004, "/private")), ("y", shared(9003, "/y"))],
    );

    let mut mesh = MeshState::new(Hostname::new("a"), ChronoDuration::seconds(300));
    let now = Utc::now();
    mesh.apply(
        Inbound::Registry {
            hostname: Hostname::new("b"),
            registry: remote.public_view(),
        },
        now,
    );

    let table = route_table(&local, mesh.snapshot(now).remotes());
    assert!(table.find("/private").is_none());
    assert_eq!(table.find("/y").unwrap().host, "b");
    assert_eq!(table.unreachable.len(), 1);
    assert_eq!(table.unreachable[0].component, "private");
    assert!(table.warnings.is_empty());
}
