//! Secret store collaborators.
//!
//! The reconciler only ever asks for a value by name. Values are read at
//! deploy time and written into the local registry; they are never
//! published to other nodes.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::ResolutionError;

/// Keyed lookup of secret values.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, name: &str) -> Result<String, ResolutionError>;
}

/// One file per secret under a directory, e.g. `~/.castle/secrets/API_KEY`.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_valid_secret_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl SecretStore for FileSecretStore {
    fn resolve(&self, name: &str) -> Result<String, ResolutionError> {
        if !is_valid_secret_name(name) {
            return Err(ResolutionError::InvalidSecretName {
                name: name.to_string(),
            });
        }
        match std::fs::read_to_string(self.dir.join(name)) {
            Ok(value) => Ok(value.trim_end().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ResolutionError::SecretNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(ResolutionError::SecretUnreadable {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Secrets held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    values: BTreeMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for MemorySecretStore {
    fn resolve(&self, name: &str) -> Result<String, ResolutionError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| ResolutionError::SecretNotFound {
                name: name.to_string(),
            })
    }
}

const SECRET_OPEN: &str = "${secret:";

/// Replace every `${secret:NAME}` in `value`.
///
/// An unterminated reference is left as written.
pub fn substitute_secrets(value: &str, store: &dyn SecretStore) -> Result<String, ResolutionError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find(SECRET_OPEN) {
        let after = &rest[start + SECRET_OPEN.len()..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(&store.resolve(&after[..end])?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitution() {
        let store = MemorySecretStore::new()
            .with("DB_PASS", "hunter2")
            .with("USER", "castle");
        assert_eq!(
            substitute_secrets("postgres://${secret:USER}:${secret:DB_PASS}@db", &store).unwrap(),
            "postgres://castle:hunter2@db"
        );
        assert_eq!(substitute_secrets("plain", &store).unwrap(), "plain");
        assert_eq!(
            substitute_secrets("broken ${secret:USER", &store).unwrap(),
            "broken ${secret:USER"
        );
    }

    #[test]
    fn test_missing_secret_is_error() {
        let store = MemorySecretStore::new();
        assert_eq!(
            substitute_secrets("${secret:NOPE}", &store),
            Err(ResolutionError::SecretNotFound {
                name: "NOPE".into()
            })
        );
    }

    #[test]
    fn test_file_store_trims_and_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("API_KEY"), "abc123\n").unwrap();
        let store = FileSecretStore::new(dir.path());

        assert_eq!(store.resolve("API_KEY").unwrap(), "abc123");
        assert!(matches!(
            store.resolve("MISSING"),
            Err(ResolutionError::SecretNotFound { .. })
        ));
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(ResolutionError::InvalidSecretName { .. })
        ));
    }
}
