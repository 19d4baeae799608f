//! Mesh task wiring.

use std::collections::BTreeMap;
use std::time::Duration;

use castle_types::{EventEnvelope, Hostname, NodeRegistry};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MeshConfig;
use crate::discovery::{spawn_discovery, Advertisement, DiscoveredPeer};
use crate::session::{BrokerStatus, MeshSession};
use crate::state::{spawn_state_task, spawn_sweep_task, MeshCommand, MeshSnapshot, MeshState};
use crate::topic::Topics;

/// Mesh summary for the API.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub enabled: bool,
    pub hostname: Hostname,
    pub broker: BrokerStatus,
    pub peers: usize,
    pub online_peers: usize,
    pub discovered: usize,
    pub stale_after_secs: i64,
}

/// Read side of a running mesh, cheap to clone.
#[derive(Clone)]
pub struct MeshHandle {
    enabled: bool,
    hostname: Hostname,
    snapshot: watch::Receiver<MeshSnapshot>,
    broker: watch::Receiver<BrokerStatus>,
    discovered: watch::Receiver<BTreeMap<Hostname, DiscoveredPeer>>,
}

impl MeshHandle {
    /// A handle that never sees any peer.
    pub fn disabled(hostname: Hostname, config: &MeshConfig) -> Self {
        let (_, snapshot) = watch::channel(MeshSnapshot::empty(config.stale_after()));
        let (_, broker) = watch::channel(BrokerStatus::default());
        let (_, discovered) = watch::channel(BTreeMap::new());
        Self {
            enabled: false,
            hostname,
            snapshot,
            broker,
            discovered,
        }
    }

    /// Current remote registries, excluding peers that went stale since the
    /// last change.
    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot.borrow().fresh(Utc::now())
    }

    /// Subscribe to raw snapshot updates.
    pub fn watch(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot.clone()
    }

    pub fn discovered(&self) -> BTreeMap<Hostname, DiscoveredPeer> {
        self.discovered.borrow().clone()
    }

    pub fn broker(&self) -> BrokerStatus {
        self.broker.borrow().clone()
    }

    pub fn status(&self) -> MeshStatus {
        let snapshot = self.snapshot();
        MeshStatus {
            enabled: self.enabled,
            hostname: self.hostname.clone(),
            broker: self.broker(),
            peers: snapshot.nodes.len(),
            online_peers: snapshot.online_count(),
            discovered: self.discovered.borrow().len(),
            stale_after_secs: snapshot.stale_after_secs,
        }
    }
}

/// A started mesh: the read handle plus the tasks to join on shutdown.
pub struct MeshManager {
    handle: MeshHandle,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MeshManager {
    /// Spawn the state owner, sweep, bus session and discovery tasks.
    ///
    /// Discovery failure is logged and the mesh runs without it; the bus
    /// session still works with a configured broker.
    pub fn start(
        config: MeshConfig,
        hostname: Hostname,
        api_port: u16,
        registry: watch::Receiver<NodeRegistry>,
        event_tx: broadcast::Sender<EventEnvelope>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        if !config.enabled {
            info!("Mesh disabled");
            return Self {
                handle: MeshHandle::disabled(hostname, &config),
                tasks: Vec::new(),
            };
        }

        let topics = Topics::new(config.namespace.clone(), hostname.clone());
        let (command_tx, command_rx) = mpsc::channel::<MeshCommand>(256);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(MeshSnapshot::empty(config.stale_after()));
        let (status_tx, status_rx) = watch::channel(BrokerStatus::default());
        let (broker_tx, broker_rx) = watch::channel(config.broker.clone());

        let mut tasks = Vec::new();
        tasks.push((
            "mesh-state",
            spawn_state_task(
                MeshState::new(hostname.clone(), config.stale_after()),
                command_rx,
                snapshot_tx,
                event_tx.clone(),
                shutdown.clone(),
            ),
        ));
        tasks.push((
            "mesh-sweep",
            spawn_sweep_task(command_tx.clone(), config.sweep_interval(), shutdown.clone()),
        ));

        let discovered = if config.discovery {
            let advertisement = Advertisement {
                hostname: hostname.clone(),
                gateway_port: registry.borrow().node.gateway_port,
                api_port,
                broker: config.broker.clone(),
            };
            // a configured broker always wins over one found on the LAN
            let broker_updates = config.broker.is_none().then(|| broker_tx.clone());
            let started =
                spawn_discovery(advertisement, broker_updates, event_tx.clone(), shutdown.clone());
            match started {
                Ok(discovery) => {
                    tasks.push(("mesh-discovery", discovery.task));
                    discovery.peers
                }
                Err(e) => {
                    warn!(error = %e, "mDNS discovery unavailable");
                    watch::channel(BTreeMap::new()).1
                }
            }
        } else {
            watch::channel(BTreeMap::new()).1
        };
        // discovery holds its own sender when it may replace the broker
        drop(broker_tx);

        if config.publish || config.subscribe {
            let session = MeshSession::new(
                config.clone(),
                topics,
                registry,
                broker_rx,
                command_tx,
                status_tx,
                event_tx,
            );
            tasks.push(("mesh-session", tokio::spawn(session.run(shutdown))));
        } else {
            info!("Mesh publish and subscribe both off; not joining the bus");
        }

        info!(
            hostname = %hostname,
            namespace = %config.namespace,
            broker = ?config.broker,
            publish = config.publish,
            subscribe = config.subscribe,
            discovery = config.discovery,
            "Mesh started"
        );

        Self {
            handle: MeshHandle {
                enabled: true,
                hostname,
                snapshot: snapshot_rx,
                broker: status_rx,
                discovered,
            },
            tasks,
        }
    }

    pub fn handle(&self) -> MeshHandle {
        self.handle.clone()
    }

    /// Wait for every task to finish, abandoning any still running after
    /// `grace`.
    pub async fn join(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for (name, task) in self.tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Mesh task failed"),
                Err(_) => {
                    warn!(task = name, "Mesh task did not stop in time");
                    abort.abort();
                }
            }
        }
    }
}
