//! Health status types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness of a registry entry.
///
/// `Unknown` only until the first probe. Entries without a health surface
/// are never probed and stay `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
    #[default]
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => write!(f, "up"),
            HealthState::Down => write!(f, "down"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Last known health of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub name: String,
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    /// Why the last probe failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthState::Unknown,
            latency_ms: None,
            checked_at: None,
            error: None,
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthState::Up
    }
}

/// The full status set after one monitor tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub statuses: Vec<HealthStatus>,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn get(&self, name: &str) -> Option<&HealthStatus> {
        self.statuses.iter().find(|s| s.name == name)
    }

    pub fn count(&self, state: HealthState) -> usize {
        self.statuses.iter().filter(|s| s.status == state).count()
    }
}
