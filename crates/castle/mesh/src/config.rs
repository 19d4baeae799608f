//! Mesh configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A bus broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for the mesh state manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First topic level; every node in one mesh must agree on it.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Fixed broker. When unset the broker is taken from LAN discovery.
    #[serde(default)]
    pub broker: Option<BrokerAddress>,

    /// Remote registries older than this are expired.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How often the local registry is republished while connected.
    /// Must stay below `stale_after_secs` or healthy peers expire.
    #[serde(default = "default_republish_interval_secs")]
    pub republish_interval_secs: u64,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    /// Publish this node's registry and presence.
    #[serde(default = "default_true")]
    pub publish: bool,

    /// Receive the registries of other nodes.
    #[serde(default = "default_true")]
    pub subscribe: bool,

    /// Advertise and browse over mDNS.
    #[serde(default = "default_true")]
    pub discovery: bool,
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "castle".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_republish_interval_secs() -> u64 {
    60
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_min_ms() -> u64 {
    500
}

fn default_reconnect_max_secs() -> u64 {
    30
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_namespace(),
            broker: None,
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            republish_interval_secs: default_republish_interval_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            publish: true,
            subscribe: true,
            discovery: true,
        }
    }
}

impl MeshConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_default_on_and_toggle_alone() {
        let config = MeshConfig::default();
        assert!(config.publish && config.subscribe && config.discovery);

        let config: MeshConfig = serde_json::from_str(r#"{"publish": false}"#).unwrap();
        assert!(!config.publish);
        assert!(config.subscribe);
        assert!(config.discovery);
        assert_eq!(config.stale_after_secs, 300);
    }
}
