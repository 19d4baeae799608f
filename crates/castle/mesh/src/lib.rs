//! # Castle Mesh
//!
//! Keeps every node's registry in sync over an MQTT broker so the gateway on
//! each node can route to services running elsewhere.
//!
//! - [`session`]: the bus connection, with a retained `online` marker, a last
//!   will of `offline` and retained registry publishes
//! - [`state`]: the single-writer map of remote registries and the
//!   staleness sweep
//! - [`discovery`]: mDNS advertisement and broker lookup
//! - [`manager`]: starts the tasks and hands out a [`MeshHandle`]
//!
//! Remote registries that stop being refreshed are expired after
//! [`MeshConfig::stale_after_secs`] even when no last will was delivered.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod config;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod session;
pub mod state;
pub mod topic;

pub use config::{BrokerAddress, MeshConfig};
pub use discovery::{DiscoveredPeer, CASTLE_SERVICE_TYPE, MQTT_SERVICE_TYPE};
pub use error::{MeshError, MeshResult};
pub use manager::{MeshHandle, MeshManager, MeshStatus};
pub use session::{decode_message, BrokerStatus, MeshSession};
pub use state::{Inbound, MeshCommand, MeshSnapshot, MeshState};
pub use topic::Topics;
