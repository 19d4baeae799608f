//! Event types for Castle observability
//!
//! Health ticks, mesh changes and deploys are published as a single stream
//! of [`EventEnvelope`]s.

use crate::health::{HealthSnapshot, HealthState};
use crate::ids::Hostname;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all Castle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// Node that produced the event
    pub hostname: Option<Hostname>,

    /// Actor who triggered the event
    pub actor: Option<String>,

    /// The actual event
    pub event: CastleEvent,
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Reconciler
    Deploy,
    /// Health monitor
    Health,
    /// Mesh state manager
    Mesh,
    /// LAN discovery
    Discovery,
    /// Daemon lifecycle
    Daemon,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Castle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CastleEvent {
    /// Full status set after a monitor tick
    HealthUpdated(HealthSnapshot),

    /// One entry changed state
    HealthChanged {
        name: String,
        from: HealthState,
        to: HealthState,
    },

    /// Mesh membership or transport change
    Mesh(MeshEvent),

    /// A deploy finished
    Deployed {
        deployed: Vec<String>,
        failed: Vec<String>,
        preserved: Vec<String>,
    },

    /// The daemon is stopping
    ShuttingDown,
}

/// Mesh events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshEvent {
    /// A peer published a registry
    PeerUpdated { hostname: Hostname, entries: usize },

    /// A peer announced itself online
    PeerOnline { hostname: Hostname },

    /// A peer announced itself offline or its last will fired
    PeerOffline { hostname: Hostname },

    /// A peer went silent past the staleness threshold
    PeerExpired { hostname: Hostname },

    /// Connected to the bus broker
    BrokerConnected { host: String, port: u16 },

    /// Lost the bus connection; this node is offline to its peers
    BrokerDisconnected { reason: String },

    /// A broker address was found on the LAN
    BrokerDiscovered { host: String, port: u16 },

    /// A peer was found on the LAN
    PeerDiscovered {
        hostname: Hostname,
        addresses: Vec<String>,
    },

    /// A LAN peer disappeared
    PeerLost { hostname: Hostname },
}

impl EventEnvelope {
    /// Create a new event envelope
    pub fn new(event: CastleEvent, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity: Self::infer_severity(&event),
            hostname: None,
            actor: None,
            event,
        }
    }

    /// Attach the producing node
    pub fn with_hostname(mut self, hostname: Hostname) -> Self {
        self.hostname = Some(hostname);
        self
    }

    /// Add actor
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    fn infer_severity(event: &CastleEvent) -> EventSeverity {
        match event {
            CastleEvent::HealthUpdated(_) => EventSeverity::Debug,
            CastleEvent::HealthChanged { to, .. } => match to {
                HealthState::Down => EventSeverity::Warning,
                HealthState::Up | HealthState::Unknown => EventSeverity::Info,
            },
            CastleEvent::Mesh(mesh) => match mesh {
                MeshEvent::PeerOffline { .. }
                | MeshEvent::PeerExpired { .. }
                | MeshEvent::BrokerDisconnected { .. } => EventSeverity::Warning,
                MeshEvent::PeerUpdated { .. } | MeshEvent::PeerDiscovered { .. } => {
                    EventSeverity::Debug
                }
                _ => EventSeverity::Info,
            },
            CastleEvent::Deployed { failed, .. } if !failed.is_empty() => EventSeverity::Warning,
            CastleEvent::Deployed { .. } | CastleEvent::ShuttingDown => EventSeverity::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_inference() {
        let down = EventEnvelope::new(
            CastleEvent::HealthChanged {
                name: "notes".into(),
                from: HealthState::Up,
                to: HealthState::Down,
            },
            EventSource::Health,
        );
        assert_eq!(down.severity, EventSeverity::Warning);

        let expired = EventEnvelope::new(
            CastleEvent::Mesh(MeshEvent::PeerExpired {
                hostname: Hostname::new("b"),
            }),
            EventSource::Mesh,
        );
        assert_eq!(expired.severity, EventSeverity::Warning);

        let deployed = EventEnvelope::new(
            CastleEvent::Deployed {
                deployed: vec!["a".into()],
                failed: vec![],
                preserved: vec![],
            },
            EventSource::Deploy,
        )
        .with_actor("cli");
        assert_eq!(deployed.severity, EventSeverity::Info);
        assert_eq!(deployed.actor.as_deref(), Some("cli"));
    }

    #[test]
    fn test_json_shape() {
        let event = EventEnvelope::new(
            CastleEvent::Mesh(MeshEvent::PeerOffline {
                hostname: Hostname::new("b"),
            }),
            EventSource::Mesh,
        )
        .with_hostname(Hostname::new("a"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"]["type"], "mesh");
        assert_eq!(value["event"]["data"]["kind"], "peer_offline");
        assert_eq!(value["event"]["data"]["hostname"], "b");
        assert_eq!(value["hostname"], "a");
    }
}
