//! Error types for castle-deploy.

use castle_types::ValidationError;
use serde::Serialize;
use thiserror::Error;

/// A failure scoped to one entry during reconciliation.
///
/// The entry is left out of the new registry (or its previous version is
/// kept); other entries are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionError {
    #[error("executable {name:?} not found on the search path")]
    ExecutableNotFound { name: String },

    #[error("no container runtime found (tried podman, docker)")]
    NoContainerRuntime,

    #[error("secret {name:?} not found")]
    SecretNotFound { name: String },

    #[error("secret {name:?} could not be read: {reason}")]
    SecretUnreadable { name: String, reason: String },

    #[error("invalid secret name {name:?}")]
    InvalidSecretName { name: String },

    #[error("{path} is inside the source tree {root}")]
    SourceTreeReference { path: String, root: String },
}

/// Errors reading or writing on-disk state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed registry: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to replace {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: tempfile::PersistError,
    },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type for registry persistence.
pub type StoreResult<T> = Result<T, StoreError>;
