//! # Castle Health
//!
//! Polls the HTTP health surface of every registry entry that declares one
//! and keeps the last known [`HealthStatus`](castle_types::HealthStatus).
//!
//! Per entry the state machine is `unknown -> {up, down}` then `up <-> down`.
//! Entries without a health surface are never probed and report `unknown`.
//! After every tick the full status set is broadcast; slow subscribers lag
//! and skip snapshots rather than holding up the poll loop.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod config;
pub mod error;
pub mod monitor;
pub mod probe;

pub use config::HealthConfig;
pub use error::ProbeError;
pub use monitor::HealthMonitor;
pub use probe::{HttpProbe, Probe};
