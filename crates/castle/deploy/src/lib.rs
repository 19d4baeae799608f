//! # Castle Deploy
//!
//! Reconciles a validated [`castle_types::Specification`] into the
//! [`castle_types::NodeRegistry`] for this machine.
//!
//! For every service and job in scope the [`Reconciler`]:
//!
//! 1. resolves the run target to an absolute executable through an
//!    [`ExecutableResolver`],
//! 2. expands `<PREFIX>_DATA_DIR` / `<PREFIX>_PORT` conventions, letting
//!    `defaults.env` override them,
//! 3. substitutes `${secret:NAME}` references from a [`SecretStore`],
//! 4. writes the entry into the new registry.
//!
//! Failures are per entry and reported in a [`DeployReport`]. The registry
//! is persisted with [`RegistryStore`].

#![deny(unsafe_code)]

pub mod command;
pub mod error;
pub mod reconciler;
pub mod resolve;
pub mod secrets;
pub mod store;

pub use command::build_run_command;
pub use error::{ResolutionError, StoreError, StoreResult};
pub use reconciler::{
    env_prefix, DeployOutcome, DeployReport, DeployScope, EntryFailure, Reconciler,
    ReconcilerConfig, DEFAULT_DATA_ROOT,
};
pub use resolve::{ExecutableResolver, PathResolver, StaticResolver};
pub use secrets::{substitute_secrets, FileSecretStore, MemorySecretStore, SecretStore};
pub use store::{castle_home, read_specification, write_atomic, RegistryStore};
