//! The poll loop.
//!
//! One tick probes every eligible entry concurrently and waits for all of
//! them before the next tick can start, so two probes for the same entry are
//! never in flight together. The registry is read through a `watch` channel;
//! a new deploy changes the probe set on the following tick.

use std::sync::Arc;
use std::time::Instant;

use castle_types::{
    CastleEvent, EventEnvelope, EventSource, HealthSnapshot, HealthState, HealthStatus,
    NodeRegistry,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::ProbeError;
use crate::probe::Probe;

/// Tracks the last known health of every registry entry.
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn Probe>,
    registry: watch::Receiver<NodeRegistry>,
    statuses: DashMap<String, HealthStatus>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        probe: Arc<dyn Probe>,
        registry: watch::Receiver<NodeRegistry>,
        event_tx: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        Self {
            config,
            probe,
            registry,
            statuses: DashMap::new(),
            event_tx,
        }
    }

    /// Receive every snapshot and transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Current status set, sorted by entry name.
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut statuses: Vec<HealthStatus> =
            self.statuses.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        HealthSnapshot {
            statuses,
            timestamp: Utc::now(),
        }
    }

    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.statuses.get(name).map(|s| s.value().clone())
    }

    /// Run one probe round and publish the resulting snapshot.
    pub async fn tick(&self) -> HealthSnapshot {
        let registry = self.registry.borrow().clone();
        self.statuses
            .retain(|name, _| registry.deployed.contains_key(name));

        let mut targets = Vec::new();
        for (name, entry) in &registry.deployed {
            match entry.health_url() {
                Some(url) => {
                    self.statuses
                        .entry(name.clone())
                        .or_insert_with(|| HealthStatus::unknown(name.clone()));
                    targets.push((name.clone(), url));
                }
                None => {
                    // a surface that was removed by a redeploy no longer says anything
                    self.statuses
                        .insert(name.clone(), HealthStatus::unknown(name.clone()));
                }
            }
        }

        let timeout = self.config.timeout();
        let probes = targets.into_iter().map(|(name, url)| {
            let probe = Arc::clone(&self.probe);
            async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, probe.check(&url)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                (name, result, started.elapsed().as_millis() as u64)
            }
        });

        for (name, result, latency_ms) in join_all(probes).await {
            self.record(name, result, latency_ms);
        }

        let snapshot = self.snapshot();
        debug!(
            up = snapshot.count(HealthState::Up),
            down = snapshot.count(HealthState::Down),
            unknown = snapshot.count(HealthState::Unknown),
            "Health tick complete"
        );
        let _ = self.event_tx.send(EventEnvelope::new(
            CastleEvent::HealthUpdated(snapshot.clone()),
            EventSource::Health,
        ));
        snapshot
    }

    fn record(&self, name: String, result: Result<(), ProbeError>, latency_ms: u64) {
        let (status, error) = match result {
            Ok(()) => (HealthState::Up, None),
            Err(e) => (HealthState::Down, Some(e.to_string())),
        };
        let previous = self
            .statuses
            .get(&name)
            .map(|s| s.status)
            .unwrap_or_default();

        if previous != status {
            match status {
                HealthState::Down => warn!(
                    name = %name,
                    from = %previous,
                    error = error.as_deref().unwrap_or_default(),
                    "Entry is down"
                ),
                _ => info!(name = %name, from = %previous, to = %status, "Health changed"),
            }
            let _ = self.event_tx.send(EventEnvelope::new(
                CastleEvent::HealthChanged {
                    name: name.clone(),
                    from: previous,
                    to: status,
                },
                EventSource::Health,
            ));
        }

        self.statuses.insert(
            name.clone(),
            HealthStatus {
                name,
                status,
                latency_ms: Some(latency_ms),
                checked_at: Some(Utc::now()),
                error,
            },
        );
    }

    /// Tick on the configured interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "Health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }
}
