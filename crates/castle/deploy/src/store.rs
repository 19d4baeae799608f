//! On-disk state: the specification file and the persisted registry.

use std::io::Write;
use std::path::{Path, PathBuf};

use castle_types::{NodeRegistry, Specification};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Castle's state directory, `~/.castle`.
pub fn castle_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".castle"))
}

/// Read and validate a specification file.
pub fn read_specification(path: &Path) -> StoreResult<Specification> {
    let raw = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    Ok(Specification::load(&raw)?)
}

/// The persisted node registry, usually `~/.castle/registry.yaml`.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry; `None` if nothing has been deployed yet.
    pub fn load(&self) -> StoreResult<Option<NodeRegistry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(NodeRegistry::from_yaml(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    /// Replace the registry file atomically.
    pub fn save(&self, registry: &NodeRegistry) -> StoreResult<()> {
        let yaml = registry.to_yaml()?;
        write_atomic(&self.path, yaml.as_bytes())?;
        debug!(path = %self.path.display(), entries = registry.deployed.len(), "Saved registry");
        Ok(())
    }
}

/// Write `contents` to a temp file beside `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(())
}
