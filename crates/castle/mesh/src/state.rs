//! Remote registry state.
//!
//! [`MeshState`] is plain data mutated only by the owner task started with
//! [`spawn_state_task`]. Inbound messages are applied strictly in arrival
//! order. Readers never touch the map; they get a [`MeshSnapshot`] from a
//! `watch` channel that the owner replaces after every change.

use std::collections::BTreeMap;

use castle_types::{
    CastleEvent, EventEnvelope, EventSource, Hostname, MeshEvent, PublicRegistry, RemoteRegistry,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A decoded message from another node.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Registry {
        hostname: Hostname,
        registry: PublicRegistry,
    },
    Presence {
        hostname: Hostname,
        online: bool,
    },
}

impl Inbound {
    pub fn hostname(&self) -> &Hostname {
        match self {
            Inbound::Registry { hostname, .. } | Inbound::Presence { hostname, .. } => hostname,
        }
    }
}

/// Work for the owner task.
#[derive(Debug)]
pub enum MeshCommand {
    Apply(Inbound),
    Sweep,
}

/// Presence seen before the peer's first registry.
#[derive(Debug, Clone, Copy)]
struct PendingPresence {
    online: bool,
    received_at: DateTime<Utc>,
}

/// Every known remote registry.
#[derive(Debug, Clone)]
pub struct MeshState {
    local: Hostname,
    stale_after: chrono::Duration,
    nodes: BTreeMap<Hostname, RemoteRegistry>,
    pending: BTreeMap<Hostname, PendingPresence>,
}

impl MeshState {
    pub fn new(local: Hostname, stale_after: chrono::Duration) -> Self {
        Self {
            local,
            stale_after,
            nodes: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Apply one inbound message. Messages about this node are ignored.
    pub fn apply(&mut self, message: Inbound, now: DateTime<Utc>) -> Option<MeshEvent> {
        if message.hostname() == &self.local {
            return None;
        }

        match message {
            Inbound::Registry { hostname, registry } => {
                let entries = registry.deployed.len();
                // retained status and registry may arrive in either order
                let online = match self.pending.remove(&hostname) {
                    Some(presence) if !self.nodes.contains_key(&hostname) => presence.online,
                    _ => true,
                };
                self.nodes.insert(
                    hostname.clone(),
                    RemoteRegistry {
                        hostname: hostname.clone(),
                        registry,
                        received_at: now,
                        online,
                    },
                );
                Some(MeshEvent::PeerUpdated { hostname, entries })
            }
            Inbound::Presence { hostname, online } if !self.nodes.contains_key(&hostname) => {
                self.pending.insert(
                    hostname,
                    PendingPresence {
                        online,
                        received_at: now,
                    },
                );
                None
            }
            Inbound::Presence {
                hostname,
                online: true,
            } => {
                let node = self.nodes.get_mut(&hostname)?;
                if node.online {
                    return None;
                }
                node.online = true;
                Some(MeshEvent::PeerOnline { hostname })
            }
            Inbound::Presence {
                hostname,
                online: false,
            } => {
                // stays listed until stale so the peer list shows it offline
                let node = self.nodes.get_mut(&hostname)?;
                if !node.online {
                    return None;
                }
                node.online = false;
                Some(MeshEvent::PeerOffline { hostname })
            }
        }
    }

    /// Remove peers whose registry is older than the staleness threshold.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<Hostname> {
        let stale: Vec<Hostname> = self
            .nodes
            .values()
            .filter(|n| n.is_stale(now, self.stale_after))
            .map(|n| n.hostname.clone())
            .collect();
        for hostname in &stale {
            self.nodes.remove(hostname);
        }
        let stale_after = self.stale_after;
        self.pending
            .retain(|_, presence| now - presence.received_at <= stale_after);
        stale
    }

    /// Point-in-time copy excluding anything already stale at `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> MeshSnapshot {
        MeshSnapshot {
            nodes: self
                .nodes
                .iter()
                .filter(|(_, n)| !n.is_stale(now, self.stale_after))
                .map(|(h, n)| (h.clone(), n.clone()))
                .collect(),
            taken_at: now,
            stale_after_secs: self.stale_after.num_seconds(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Peers heard from only through presence so far.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// What readers see of the mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshSnapshot {
    pub nodes: BTreeMap<Hostname, RemoteRegistry>,
    pub taken_at: DateTime<Utc>,
    pub stale_after_secs: i64,
}

impl MeshSnapshot {
    pub fn empty(stale_after: chrono::Duration) -> Self {
        Self {
            nodes: BTreeMap::new(),
            taken_at: Utc::now(),
            stale_after_secs: stale_after.num_seconds(),
        }
    }

    /// Drop peers that have gone stale since the snapshot was taken.
    pub fn fresh(&self, now: DateTime<Utc>) -> MeshSnapshot {
        let threshold = chrono::Duration::seconds(self.stale_after_secs);
        MeshSnapshot {
            nodes: self
                .nodes
                .iter()
                .filter(|(_, n)| !n.is_stale(now, threshold))
                .map(|(h, n)| (h.clone(), n.clone()))
                .collect(),
            taken_at: now,
            stale_after_secs: self.stale_after_secs,
        }
    }

    pub fn get(&self, hostname: &str) -> Option<&RemoteRegistry> {
        self.nodes.get(hostname)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemoteRegistry> {
        self.nodes.values()
    }

    pub fn online_count(&self) -> usize {
        self.nodes.values().filter(|n| n.online).count()
    }
}

/// Start the owner task. It stops when every command sender is dropped or
/// `shutdown` flips to true.
pub fn spawn_state_task(
    mut state: MeshState,
    mut commands: mpsc::Receiver<MeshCommand>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    event_tx: broadcast::Sender<EventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let local = state.local.clone();
    tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let now = Utc::now();
            let events: Vec<MeshEvent> = match command {
                MeshCommand::Apply(message) => state.apply(message, now).into_iter().collect(),
                MeshCommand::Sweep => state
                    .expire_stale(now)
                    .into_iter()
                    .map(|hostname| MeshEvent::PeerExpired { hostname })
                    .collect(),
            };
            if events.is_empty() {
                continue;
            }

            snapshot_tx.send_replace(state.snapshot(now));
            for event in events {
                log_event(&event);
                let _ = event_tx.send(
                    EventEnvelope::new(CastleEvent::Mesh(event), EventSource::Mesh)
                        .with_hostname(local.clone()),
                );
            }
        }
        debug!(peers = state.len(), "Mesh state task stopped");
    })
}

/// Send a sweep command on every tick until `shutdown` flips to true.
pub fn spawn_sweep_task(
    commands: mpsc::Sender<MeshCommand>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately and there is nothing to sweep yet
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if commands.send(MeshCommand::Sweep).await.is_err() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::PeerUpdated { hostname, entries } => {
            info!(peer = %hostname, entries, "Mesh: peer registry updated")
        }
        MeshEvent::PeerOnline { hostname } => info!(peer = %hostname, "Mesh: peer online"),
        MeshEvent::PeerOffline { hostname } => warn!(peer = %hostname, "Mesh: peer offline"),
        MeshEvent::PeerExpired { hostname } => {
            warn!(peer = %hostname, "Mesh: peer expired after going silent")
        }
        other => debug!(event = ?other, "Mesh event"),
    }
}
