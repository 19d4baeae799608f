//! Node registry.
//!
//! The concrete, machine-specific record of what should be running on a
//! node. Written by the reconciler once per deploy and read by the
//! generators, the health monitor and the mesh publisher. Entries carry
//! only resolved values: absolute executable paths and fully substituted
//! environments.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Hostname;
use crate::run::RunnerKind;
use crate::spec::{RestartPolicy, SystemdSpec};

/// Upstream host used when an entry does not record where it listens.
pub const DEFAULT_UPSTREAM_HOST: &str = "127.0.0.1";

/// Node identity recorded with the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub hostname: Hostname,
    pub gateway_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_root: Option<String>,
}

/// Whether an entry came from the services or the jobs catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Service,
    Job,
}

/// Target of a `remote` runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

/// Resolved supervision parameters of a managed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supervision {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    pub wanted_by: Vec<String>,
    pub restart: RestartPolicy,
    pub restart_sec: u32,
    pub no_new_privileges: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_reload: Option<Vec<String>>,
}

impl From<&SystemdSpec> for Supervision {
    fn from(spec: &SystemdSpec) -> Self {
        Self {
            after: spec.after.clone(),
            requires: spec.requires.clone(),
            wanted_by: spec.wanted_by.clone(),
            restart: spec.restart,
            restart_sec: spec.restart_sec,
            no_new_privileges: spec.no_new_privileges,
            exec_reload: spec.exec_reload.clone(),
        }
    }
}

/// One deployed service or job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedEntry {
    pub kind: EntryKind,
    pub runner: RunnerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Absolute executable followed by its arguments. Empty for remote entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervision: Option<Supervision>,
}

impl DeployedEntry {
    /// URL probed by the health monitor, if the entry has a health surface.
    pub fn health_url(&self) -> Option<String> {
        if let Some(url) = self.remote.as_ref().and_then(|r| r.health_url.clone()) {
            return Some(url);
        }
        let port = self.port?;
        let path = self.health_path.as_ref()?;
        Some(format!("http://{}:{}{}", self.upstream_host(), port, path))
    }

    /// Host this entry listens on, as seen from this node.
    pub fn upstream_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_UPSTREAM_HOST)
    }

    pub fn public_view(&self) -> PublicEntry {
        PublicEntry {
            kind: self.kind,
            runner: self.runner,
            description: self.description.clone(),
            host: self.host.clone(),
            port: self.port,
            base_url: self.remote.as_ref().map(|r| r.base_url.clone()),
            health_path: self.health_path.clone(),
            proxy_path: self.proxy_path.clone(),
            schedule: self.schedule.clone(),
            managed: self.managed,
        }
    }
}

/// The resolved record of everything deployed on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistry {
    pub node: NodeConfig,
    #[serde(default)]
    pub deployed: BTreeMap<String, DeployedEntry>,
}

impl NodeRegistry {
    pub fn empty(node: NodeConfig) -> Self {
        Self {
            node,
            deployed: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&DeployedEntry> {
        self.deployed.get(name)
    }

    pub fn managed(&self) -> impl Iterator<Item = (&String, &DeployedEntry)> {
        self.deployed.iter().filter(|(_, e)| e.managed)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Copy safe to publish to other nodes: no environment, no command line.
    pub fn public_view(&self) -> PublicRegistry {
        PublicRegistry {
            node: self.node.clone(),
            deployed: self
                .deployed
                .iter()
                .map(|(name, entry)| (name.clone(), entry.public_view()))
                .collect(),
        }
    }
}

/// Published form of a deployed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicEntry {
    pub kind: EntryKind,
    pub runner: RunnerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bind address on the publishing node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Target of a `remote` runner entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub managed: bool,
}

/// Published form of a node registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRegistry {
    pub node: NodeConfig,
    #[serde(default)]
    pub deployed: BTreeMap<String, PublicEntry>,
}

/// A registry received from another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegistry {
    pub hostname: Hostname,
    pub registry: PublicRegistry,
    pub received_at: DateTime<Utc>,
    pub online: bool,
}

impl RemoteRegistry {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.received_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.age(now) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> DeployedEntry {
        DeployedEntry {
            kind: EntryKind::Service,
            runner: RunnerKind::Command,
            description: Some("Notes".into()),
            run_cmd: vec!["/usr/bin/notes".into()],
            env: BTreeMap::from([("NOTES_TOKEN".to_string(), "s3cret".to_string())]),
            host: Some("127.0.0.1".into()),
            port: Some(9001),
            health_path: Some("/health".into()),
            proxy_path: Some("/notes".into()),
            remote: None,
            schedule: None,
            timezone: None,
            managed: true,
            supervision: None,
        }
    }

    fn registry() -> NodeRegistry {
        NodeRegistry {
            node: NodeConfig {
                hostname: Hostname::new("tower"),
                gateway_port: 9000,
                static_root: None,
            },
            deployed: BTreeMap::from([("notes".to_string(), entry())]),
        }
    }

    #[test]
    fn test_health_url() {
        assert_eq!(
            entry().health_url().as_deref(),
            Some("http://127.0.0.1:9001/health")
        );

        let mut no_path = entry();
        no_path.health_path = None;
        assert_eq!(no_path.health_url(), None);

        let mut remote = no_path.clone();
        remote.remote = Some(RemoteTarget {
            base_url: "http://nas:5000".into(),
            health_url: Some("http://nas:5000/ping".into()),
        });
        assert_eq!(remote.health_url().as_deref(), Some("http://nas:5000/ping"));
    }

    #[test]
    fn test_public_view_strips_secrets() {
        let public = registry().public_view();
        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(!json.contains("/usr/bin/notes"));
        assert_eq!(public.deployed["notes"].port, Some(9001));
        assert_eq!(public.deployed["notes"].host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_unbound_entry_defaults_to_loopback() {
        let mut unbound = entry();
        unbound.host = None;
        assert_eq!(unbound.upstream_host(), DEFAULT_UPSTREAM_HOST);
        assert_eq!(
            unbound.health_url().as_deref(),
            Some("http://127.0.0.1:9001/health")
        );
    }

    #[test]
    fn test_yaml_is_stable() {
        let reg = registry();
        let first = reg.to_yaml().unwrap();
        let parsed = NodeRegistry::from_yaml(&first).unwrap();
        assert_eq!(parsed, reg);
        assert_eq!(parsed.to_yaml().unwrap(), first);
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let remote = RemoteRegistry {
            hostname: Hostname::new("b"),
            registry: registry().public_view(),
            received_at: now - chrono::Duration::seconds(301),
            online: true,
        };
        assert!(remote.is_stale(now, chrono::Duration::seconds(300)));
        assert!(!remote.is_stale(now, chrono::Duration::seconds(600)));
    }
}
