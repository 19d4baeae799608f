//! # Castle Types
//!
//! Core types shared by every Castle crate:
//!
//! - [`Specification`]: the typed, validated declaration of components,
//!   services and jobs loaded from `castle.yaml`
//! - [`RunSpec`]: how a service or job process is started
//! - [`Role`]: the derived classification of a catalog entry
//! - [`NodeRegistry`]: the resolved, machine-specific record of what runs here
//! - [`HealthStatus`] / [`HealthSnapshot`]: liveness as seen by the monitor
//! - [`EventEnvelope`]: the unified event stream consumed by observers
//!
//! This crate performs no I/O. Loading a specification parses and validates
//! text that the caller has already read.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod error;
pub mod events;
pub mod health;
pub mod ids;
pub mod registry;
pub mod role;
pub mod run;
pub mod schedule;
pub mod spec;

pub use error::{Catalog, ScheduleError, ValidationError, ValidationIssue};
pub use events::{CastleEvent, EventEnvelope, EventSeverity, EventSource, MeshEvent};
pub use health::{HealthSnapshot, HealthState, HealthStatus};
pub use ids::{is_valid_entry_name, Hostname};
pub use registry::{
    DeployedEntry, EntryKind, NodeConfig, NodeRegistry, PublicEntry, PublicRegistry,
    RemoteRegistry, RemoteTarget, Supervision, DEFAULT_UPSTREAM_HOST,
};
pub use role::{Capabilities, Role};
pub use run::{
    CommandRun, ContainerRun, NodeRun, PackageManager, PythonRun, RemoteRun, RunSpec, RunnerKind,
};
pub use schedule::{CronField, CronSchedule};
pub use spec::{
    BuildSpec, CaddySpec, ComponentSpec, DefaultsSpec, ExposeSpec, HttpExposeSpec, HttpInternal,
    HttpPublic, InstallSpec, JobSpec, ManageSpec, NodeSpec, PathInstallSpec, ProxySpec,
    RestartPolicy, ServiceSpec, Specification, SystemdSpec, TlsMode, ToolSpec, TriggerSpec,
};
