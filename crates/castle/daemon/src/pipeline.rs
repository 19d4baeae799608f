//! The deploy pipeline.
//!
//! Spec in, files out: reconcile, persist the registry, rewrite unit files
//! and the Caddyfile, optionally reload systemd and caddy, then publish the
//! new registry to the health monitor and the mesh through a `watch`
//! channel. The [`Deployer`] is the only writer of the node registry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use castle_deploy::{
    read_specification, write_atomic, DeployReport, DeployScope, FileSecretStore, PathResolver,
    Reconciler, ReconcilerConfig, RegistryStore,
};
use castle_generators::{
    generate_caddyfile, generate_units, is_generated_unit, remote_routes, Caddyfile, UnitSet,
};
use castle_mesh::MeshHandle;
use castle_types::{CastleEvent, EventEnvelope, EventSource, Hostname, NodeConfig, NodeRegistry};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, instrument, warn};

use crate::activate::{Activator, CommandActivator, NoopActivator};
use crate::config::{DaemonConfig, PathsConfig};
use crate::error::{DaemonError, DaemonResult};

/// What to deploy and how far to go.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub scope: DeployScope,
    /// Compute everything, write nothing.
    pub dry_run: bool,
    /// Reload systemd and caddy after writing.
    pub apply: bool,
    /// Who asked, for the event stream.
    pub actor: Option<String>,
}

impl Default for DeployRequest {
    fn default() -> Self {
        Self {
            scope: DeployScope::All,
            dry_run: false,
            apply: true,
            actor: None,
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploySummary {
    pub hostname: Hostname,
    pub dry_run: bool,
    pub report: DeployReport,
    /// Unit files that were (or would be) written.
    pub units_written: Vec<String>,
    /// Generated unit files no longer backed by a registry entry.
    pub units_removed: Vec<String>,
    pub unit_warnings: Vec<String>,
    pub caddyfile_changed: bool,
    pub route_warnings: Vec<String>,
    /// Reload failures; the new files are in place regardless.
    pub apply_errors: Vec<String>,
}

/// Units and gateway config for the current registry.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedArtifacts {
    pub units: UnitSet,
    pub caddyfile: Caddyfile,
}

/// Build a reconciler backed by the secrets directory and `$PATH`.
pub fn build_reconciler(config: &DaemonConfig, hostname: Hostname) -> Reconciler {
    let reconciler_config = ReconcilerConfig {
        hostname,
        data_root: config.node.data_root.clone(),
        source_root: config.node.source_root.clone(),
    };
    Reconciler::new(
        reconciler_config,
        Arc::new(FileSecretStore::new(config.paths.secrets_dir.clone())),
        Arc::new(PathResolver::new()),
    )
}

/// Registry to start from: the persisted one, or an empty registry for
/// `hostname` if nothing has been deployed.
pub fn initial_registry(store: &RegistryStore, hostname: &Hostname) -> DaemonResult<NodeRegistry> {
    let registry = store.load()?.unwrap_or_else(|| {
        NodeRegistry::empty(NodeConfig {
            hostname: hostname.clone(),
            gateway_port: castle_types::spec::DEFAULT_GATEWAY_PORT,
            static_root: None,
        })
    });
    Ok(registry)
}

/// Runs deploys and owns the registry's write side.
pub struct Deployer {
    paths: PathsConfig,
    reconciler: Reconciler,
    store: RegistryStore,
    registry_tx: watch::Sender<NodeRegistry>,
    mesh: MeshHandle,
    activator: Arc<dyn Activator>,
    event_tx: broadcast::Sender<EventEnvelope>,
    lock: Mutex<()>,
}

impl Deployer {
    pub fn new(
        paths: PathsConfig,
        reconciler: Reconciler,
        registry_tx: watch::Sender<NodeRegistry>,
        mesh: MeshHandle,
        activator: Arc<dyn Activator>,
        event_tx: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        let store = RegistryStore::new(paths.registry.clone());
        Self {
            paths,
            reconciler,
            store,
            registry_tx,
            mesh,
            activator,
            event_tx,
            lock: Mutex::new(()),
        }
    }

    /// A deployer outside the daemon: no mesh, and no remote routes in the
    /// gateway config. Reloads run only when `apply` is set.
    pub fn standalone(config: &DaemonConfig, apply: bool) -> DaemonResult<Self> {
        let hostname = config.hostname();
        let store = RegistryStore::new(config.paths.registry.clone());
        let (registry_tx, _) = watch::channel(initial_registry(&store, &hostname)?);
        let (event_tx, _) = broadcast::channel(16);
        let activator: Arc<dyn Activator> = if apply {
            Arc::new(CommandActivator::new(config.apply.clone()))
        } else {
            Arc::new(NoopActivator)
        };
        Ok(Self::new(
            config.paths.clone(),
            build_reconciler(config, hostname.clone()),
            registry_tx,
            MeshHandle::disabled(hostname, &config.mesh),
            activator,
            event_tx,
        ))
    }

    pub fn hostname(&self) -> &Hostname {
        &self.reconciler.config().hostname
    }

    /// The registry as of the last successful deploy.
    pub fn registry(&self) -> NodeRegistry {
        self.registry_tx.borrow().clone()
    }

    pub fn subscribe_registry(&self) -> watch::Receiver<NodeRegistry> {
        self.registry_tx.subscribe()
    }

    /// Run the whole pipeline. Deploys are serialized.
    ///
    /// Only an unreadable or invalid specification (or registry) fails the
    /// call; per-entry failures are in the report.
    #[instrument(skip(self), fields(hostname = %self.hostname()))]
    pub async fn deploy(&self, request: DeployRequest) -> DaemonResult<DeploySummary> {
        let _guard = self.lock.lock().await;

        let spec = read_specification(&self.paths.spec)?;
        let previous = self.store.load()?;
        let outcome = self
            .reconciler
            .deploy(&spec, previous.as_ref(), &request.scope);

        let units = generate_units(&outcome.registry);
        let caddyfile = self.caddyfile_for(&outcome.registry);
        let plan = UnitPlan::new(&self.paths.units_dir, &units)?;
        let caddyfile_changed = file_differs(&self.paths.caddyfile, &caddyfile.text);

        let mut summary = DeploySummary {
            hostname: self.hostname().clone(),
            dry_run: request.dry_run,
            report: outcome.report,
            units_written: plan.write.iter().map(|(name, _)| name.clone()).collect(),
            units_removed: plan.remove.clone(),
            unit_warnings: units.warnings.clone(),
            caddyfile_changed,
            route_warnings: caddyfile.table.messages(),
            apply_errors: Vec::new(),
        };
        for warning in &summary.route_warnings {
            warn!(warning = %warning, "Gateway route dropped");
        }

        if request.dry_run {
            info!(
                deployed = summary.report.deployed.len(),
                failed = summary.report.failed.len(),
                "Dry run complete"
            );
            return Ok(summary);
        }

        self.store.save(&outcome.registry)?;
        plan.apply(&self.paths.units_dir)?;
        if caddyfile_changed {
            write_atomic(&self.paths.caddyfile, caddyfile.text.as_bytes())?;
        }

        if request.apply {
            if plan.changed() {
                if let Err(e) = self.activator.reload_units().await {
                    warn!(error = %e, "Unit reload failed");
                    summary.apply_errors.push(e.to_string());
                }
            }
            if caddyfile_changed {
                if let Err(e) = self.activator.reload_gateway(&self.paths.caddyfile).await {
                    warn!(error = %e, "Gateway reload failed");
                    summary.apply_errors.push(e.to_string());
                }
            }
        }

        self.registry_tx.send_replace(outcome.registry);

        let report = &summary.report;
        info!(
            deployed = report.deployed.len(),
            failed = report.failed.len(),
            preserved = report.preserved.len(),
            removed = report.removed.len(),
            units_written = summary.units_written.len(),
            units_removed = summary.units_removed.len(),
            "Deploy complete"
        );

        let mut envelope = EventEnvelope::new(
            CastleEvent::Deployed {
                deployed: report.deployed.clone(),
                failed: report.failed.iter().map(|f| f.name.clone()).collect(),
                preserved: report.preserved.clone(),
            },
            EventSource::Deploy,
        )
        .with_hostname(self.hostname().clone());
        if let Some(actor) = request.actor {
            envelope = envelope.with_actor(actor);
        }
        let _ = self.event_tx.send(envelope);

        Ok(summary)
    }

    /// Rewrite the Caddyfile from the current registry and mesh snapshot.
    /// Returns whether the file changed.
    pub async fn sync_gateway(&self, apply: bool) -> DaemonResult<bool> {
        let _guard = self.lock.lock().await;

        let caddyfile = self.caddyfile();
        if !file_differs(&self.paths.caddyfile, &caddyfile.text) {
            return Ok(false);
        }
        write_atomic(&self.paths.caddyfile, caddyfile.text.as_bytes())?;
        info!(
            routes = caddyfile.table.routes.len(),
            dropped = caddyfile.table.warnings.len(),
            unreachable = caddyfile.table.unreachable.len(),
            "Gateway config updated"
        );
        if apply {
            self.activator.reload_gateway(&self.paths.caddyfile).await?;
        }
        Ok(true)
    }

    /// Gateway config for the current registry and mesh.
    pub fn caddyfile(&self) -> Caddyfile {
        let registry = self.registry_tx.borrow().clone();
        self.caddyfile_for(&registry)
    }

    pub fn render(&self) -> RenderedArtifacts {
        let registry = self.registry_tx.borrow().clone();
        RenderedArtifacts {
            units: generate_units(&registry),
            caddyfile: self.caddyfile_for(&registry),
        }
    }

    fn caddyfile_for(&self, registry: &NodeRegistry) -> Caddyfile {
        let snapshot = self.mesh.snapshot();
        let remote = remote_routes(snapshot.remotes());
        generate_caddyfile(registry, Some(&remote))
    }
}

/// Unit files to write and stale generated ones to delete.
struct UnitPlan {
    write: Vec<(String, String)>,
    remove: Vec<String>,
}

impl UnitPlan {
    fn new(dir: &Path, units: &UnitSet) -> DaemonResult<Self> {
        let wanted: BTreeSet<&str> = units.files.iter().map(|f| f.file_name.as_str()).collect();

        let write = units
            .files
            .iter()
            .filter(|f| file_differs(&dir.join(&f.file_name), &f.contents))
            .map(|f| (f.file_name.clone(), f.contents.clone()))
            .collect();

        let mut remove = Vec::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| DaemonError::io(dir, e))?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if is_generated_unit(&name) && !wanted.contains(name.as_str()) {
                        remove.push(name);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DaemonError::io(dir, e)),
        }
        remove.sort();

        Ok(Self { write, remove })
    }

    fn changed(&self) -> bool {
        !self.write.is_empty() || !self.remove.is_empty()
    }

    fn apply(&self, dir: &Path) -> DaemonResult<()> {
        for (name, contents) in &self.write {
            write_atomic(&dir.join(name), contents.as_bytes())?;
        }
        for name in &self.remove {
            let path: PathBuf = dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => info!(unit = %name, "Removed stale unit"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DaemonError::io(&path, e)),
            }
        }
        Ok(())
    }
}

fn file_differs(path: &Path, contents: &str) -> bool {
    std::fs::read_to_string(path).map_or(true, |current| current != contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use castle_deploy::{MemorySecretStore, StaticResolver};
    use castle_mesh::MeshConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SPEC: &str = r#"
node:
  gateway_port: 9000
components:
  notes:
    description: Notes app
services:
  notes:
    component: notes
    run:
      runner: command
      argv: [notes-server, --port, "9001"]
    expose:
      http:
        internal:
          port: 9001
        health_path: /health
    proxy:
      caddy:
        path_prefix: /notes
    manage:
      systemd: {}
jobs:
  backup:
    run:
      runner: command
      argv: [backup]
    schedule: "0 3 * * *"
    manage:
      systemd: {}
"#;

    #[derive(Default)]
    struct CountingActivator {
        units: AtomicUsize,
        gateway: AtomicUsize,
    }

    #[async_trait]
    impl Activator for CountingActivator {
        async fn reload_units(&self) -> DaemonResult<()> {
            self.units.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reload_gateway(&self, _caddyfile: &Path) -> DaemonResult<()> {
            self.gateway.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: PathsConfig,
        deployer: Deployer,
        events: broadcast::Receiver<EventEnvelope>,
        registry_rx: watch::Receiver<NodeRegistry>,
    }

    fn fixture(spec: &str, activator: Arc<dyn Activator>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = PathsConfig {
            spec: root.join("castle.yaml"),
            registry: root.join("registry.yaml"),
            secrets_dir: root.join("secrets"),
            units_dir: root.join("units"),
            caddyfile: root.join("Caddyfile"),
        };
        std::fs::write(&paths.spec, spec).unwrap();

        let hostname = Hostname::new("tower");
        let reconciler = Reconciler::new(
            ReconcilerConfig::new(hostname.clone()),
            Arc::new(MemorySecretStore::new()),
            Arc::new(
                StaticResolver::new()
                    .with("notes-server", "/usr/bin/notes-server")
                    .with("backup", "/usr/bin/backup"),
            ),
        );
        let (registry_tx, registry_rx) = watch::channel(NodeRegistry::empty(NodeConfig {
            hostname: hostname.clone(),
            gateway_port: 9000,
            static_root: None,
        }));
        let (event_tx, events) = broadcast::channel(16);
        let mesh = MeshHandle::disabled(hostname, &MeshConfig::default());
        let deployer = Deployer::new(
            paths.clone(),
            reconciler,
            registry_tx,
            mesh,
            activator,
            event_tx,
        );
        Fixture {
            _dir: dir,
            paths,
            deployer,
            events,
            registry_rx,
        }
    }

    #[tokio::test]
    async fn test_deploy_writes_registry_units_and_caddyfile() {
        let mut fx = fixture(SPEC, Arc::new(NoopActivator));

        let summary = fx.deployer.deploy(DeployRequest::default()).await.unwrap();
        assert_eq!(summary.report.deployed, vec!["notes", "backup"]);
        assert!(summary.report.failed.is_empty());
        assert_eq!(
            summary.units_written,
            vec![
                "castle-backup.service",
                "castle-backup.timer",
                "castle-notes.service"
            ]
        );
        assert!(summary.caddyfile_changed);

        let stored = RegistryStore::new(fx.paths.registry.clone())
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("notes").unwrap().port, Some(9001));
        assert!(fx.paths.units_dir.join("castle-notes.service").exists());
        assert!(fx.paths.units_dir.join("castle-backup.timer").exists());

        let caddyfile = std::fs::read_to_string(&fx.paths.caddyfile).unwrap();
        assert!(caddyfile.contains("handle_path /notes/* {"));
        assert!(caddyfile.contains("reverse_proxy 127.0.0.1:9001"));

        assert!(fx.registry_rx.has_changed().unwrap());
        assert!(fx.registry_rx.borrow_and_update().get("notes").is_some());

        let event = fx.events.recv().await.unwrap();
        assert!(matches!(event.event, CastleEvent::Deployed { .. }));
    }

    #[tokio::test]
    async fn test_redeploy_is_idempotent() {
        let activator = Arc::new(CountingActivator::default());
        let fx = fixture(SPEC, activator.clone());

        fx.deployer.deploy(DeployRequest::default()).await.unwrap();
        let first = std::fs::read_to_string(&fx.paths.registry).unwrap();
        assert_eq!(activator.units.load(Ordering::SeqCst), 1);
        assert_eq!(activator.gateway.load(Ordering::SeqCst), 1);

        let summary = fx.deployer.deploy(DeployRequest::default()).await.unwrap();
        let second = std::fs::read_to_string(&fx.paths.registry).unwrap();
        assert_eq!(first, second);
        assert!(summary.units_written.is_empty());
        assert!(!summary.caddyfile_changed);
        assert_eq!(activator.units.load(Ordering::SeqCst), 1);
        assert_eq!(activator.gateway.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let mut fx = fixture(SPEC, Arc::new(NoopActivator));
        let summary = fx
            .deployer
            .deploy(DeployRequest {
                dry_run: true,
                ..DeployRequest::default()
            })
            .await
            .unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.units_written.len(), 3);
        assert!(!fx.paths.registry.exists());
        assert!(!fx.paths.units_dir.exists());
        assert!(!fx.paths.caddyfile.exists());
        assert!(!fx.registry_rx.has_changed().unwrap());
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_units_are_removed() {
        let fx = fixture(SPEC, Arc::new(NoopActivator));
        std::fs::create_dir_all(&fx.paths.units_dir).unwrap();
        std::fs::write(fx.paths.units_dir.join("castle-old.service"), "[Unit]\n").unwrap();
        std::fs::write(fx.paths.units_dir.join("other.service"), "[Unit]\n").unwrap();

        let summary = fx.deployer.deploy(DeployRequest::default()).await.unwrap();
        assert_eq!(summary.units_removed, vec!["castle-old.service"]);
        assert!(!fx.paths.units_dir.join("castle-old.service").exists());
        assert!(fx.paths.units_dir.join("other.service").exists());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_fatal() {
        let fx = fixture("services: [not, a, map]\n", Arc::new(NoopActivator));
        let err = fx.deployer.deploy(DeployRequest::default()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Store(_)));
        assert!(!fx.paths.registry.exists());
    }

    #[tokio::test]
    async fn test_sync_gateway_only_writes_on_change() {
        let activator = Arc::new(CountingActivator::default());
        let fx = fixture(SPEC, activator.clone());

        assert!(fx.deployer.sync_gateway(true).await.unwrap());
        assert!(!fx.deployer.sync_gateway(true).await.unwrap());
        assert_eq!(activator.gateway.load(Ordering::SeqCst), 1);
    }
}
