//! Identifiers for Castle entities.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Name of a machine participating in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hostname(String);

impl Hostname {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hostname usable inside an mDNS record, e.g. `tower.local.`.
    pub fn as_mdns_host(&self) -> String {
        format!("{}.local.", self.0.trim_end_matches(".local").trim_end_matches('.'))
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Hostname {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Hostname {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Hostname {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entry names key the registry, unit files and env var prefixes, so they
/// are restricted to `^[a-z0-9][a-z0-9._-]{0,63}$`.
pub fn is_valid_entry_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    name.len() <= 64
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_names() {
        assert!(is_valid_entry_name("notes"));
        assert!(is_valid_entry_name("castle-api"));
        assert!(is_valid_entry_name("a1.b_c"));
        assert!(!is_valid_entry_name(""));
        assert!(!is_valid_entry_name("-leading"));
        assert!(!is_valid_entry_name("Upper"));
        assert!(!is_valid_entry_name("has space"));
        assert!(!is_valid_entry_name(&"x".repeat(65)));
    }

    #[test]
    fn test_mdns_host() {
        assert_eq!(Hostname::new("tower").as_mdns_host(), "tower.local.");
        assert_eq!(Hostname::new("tower.local").as_mdns_host(), "tower.local.");
    }
}
