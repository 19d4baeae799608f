//! # Castle Generators
//!
//! Pure functions from a [`NodeRegistry`](castle_types::NodeRegistry) to
//! text artifacts:
//!
//! - [`systemd`]: one user unit per managed entry, plus a timer for jobs
//! - [`caddy`]: the gateway Caddyfile, with remote routes merged behind
//!   local ones
//!
//! Given the same inputs every generator produces byte-identical output.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod caddy;
pub mod calendar;
pub mod routes;
pub mod systemd;

pub use caddy::{generate_caddyfile, Caddyfile};
pub use calendar::on_calendar;
pub use routes::{
    local_routes, merge_routes, remote_routes, route_table, GatewayRoute, RemoteRoutes,
    RouteCollision, RouteTable, UnreachableRoute,
};
pub use systemd::{
    generate_timer, generate_unit, generate_units, is_generated_unit, timer_name, unit_name,
    UnitFile, UnitSet, UNIT_PREFIX,
};
