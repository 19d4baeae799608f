//! Topic layout and payload codecs.
//!
//! ```text
//! <ns>/<hostname>/registry   retained JSON registry (public view)
//! <ns>/<hostname>/status     retained "online" / "offline"
//! ```

use castle_types::{Hostname, PublicRegistry};

use crate::error::{MeshError, MeshResult};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Topic names for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
    hostname: Hostname,
}

/// What a mesh topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Registry,
    Status,
}

impl Topics {
    pub fn new(namespace: impl Into<String>, hostname: Hostname) -> Self {
        Self {
            namespace: namespace.into(),
            hostname,
        }
    }

    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    pub fn client_id(&self) -> String {
        format!("castle-{}", self.hostname)
    }

    pub fn registry(&self) -> String {
        format!("{}/{}/registry", self.namespace, self.hostname)
    }

    pub fn status(&self) -> String {
        format!("{}/{}/status", self.namespace, self.hostname)
    }

    pub fn registry_filter(&self) -> String {
        format!("{}/+/registry", self.namespace)
    }

    pub fn status_filter(&self) -> String {
        format!("{}/+/status", self.namespace)
    }

    /// Split an inbound topic into publisher and kind.
    pub fn parse(&self, topic: &str) -> Option<(Hostname, TopicKind)> {
        let mut parts = topic.split('/');
        let (ns, host, kind) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || ns != self.namespace || host.is_empty() {
            return None;
        }
        let kind = match kind {
            "registry" => TopicKind::Registry,
            "status" => TopicKind::Status,
            _ => return None,
        };
        Some((Hostname::new(host), kind))
    }
}

pub fn encode_registry(registry: &PublicRegistry) -> MeshResult<Vec<u8>> {
    Ok(serde_json::to_vec(registry)?)
}

pub fn decode_registry(topic: &str, payload: &[u8]) -> MeshResult<PublicRegistry> {
    serde_json::from_slice(payload).map_err(|e| MeshError::Payload {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

/// `Some(true)` for an online marker, `Some(false)` for offline.
pub fn decode_presence(payload: &[u8]) -> Option<bool> {
    match std::str::from_utf8(payload).ok()?.trim() {
        ONLINE => Some(true),
        OFFLINE => Some(false),
        _ => None,
    }
}
