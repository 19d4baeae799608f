//! Executable resolution.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::ResolutionError;

/// Looks up an executable by name and returns its absolute path.
pub trait ExecutableResolver: Send + Sync {
    fn which(&self, name: &str) -> Result<PathBuf, ResolutionError>;
}

/// Resolves against `PATH`, optionally with extra directories searched first.
///
/// Supervised processes usually run with a minimal `PATH`, so tool install
/// directories such as `~/.local/bin` are worth adding here.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    search_path: Option<OsString>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Search `extra` before the process `PATH`.
    pub fn with_extra_dirs(extra: &[PathBuf]) -> Self {
        if extra.is_empty() {
            return Self::default();
        }
        let mut dirs: Vec<PathBuf> = extra.to_vec();
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        Self {
            search_path: std::env::join_paths(dirs).ok(),
        }
    }
}

impl ExecutableResolver for PathResolver {
    fn which(&self, name: &str) -> Result<PathBuf, ResolutionError> {
        let found = match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
                which::which_in(name, Some(paths), cwd)
            }
            None => which::which(name),
        };
        found.map_err(|_| ResolutionError::ExecutableNotFound {
            name: name.to_string(),
        })
    }
}

/// Fixed name to path table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    paths: BTreeMap<String, PathBuf>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(name.into(), path.into());
        self
    }
}

impl ExecutableResolver for StaticResolver {
    fn which(&self, name: &str) -> Result<PathBuf, ResolutionError> {
        self.paths
            .get(name)
            .cloned()
            .ok_or_else(|| ResolutionError::ExecutableNotFound {
                name: name.to_string(),
            })
    }
}
