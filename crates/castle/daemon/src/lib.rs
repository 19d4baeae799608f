//! # Castle Daemon
//!
//! `castled` ties the Castle crates together on one node:
//!
//! - the deploy pipeline ([`Deployer`]): specification to registry, unit
//!   files and Caddyfile
//! - the health monitor, fed the registry through a `watch` channel
//! - the mesh, publishing this registry and collecting everyone else's
//! - the REST API and SSE event stream under `/api/v1`
//!
//! All long-running tasks share one shutdown `watch` and are joined within
//! a grace period.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod activate;
pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod server;

pub use activate::{Activator, CommandActivator, NoopActivator};
pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError, DaemonResult};
pub use pipeline::{DeployRequest, DeploySummary, Deployer, RenderedArtifacts};
pub use server::Server;
