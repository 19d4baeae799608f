//! Caddyfile generation.
//!
//! The file is regenerated wholesale on every call. `handle_path` strips the
//! matched prefix before forwarding, so upstreams never see it.

use std::fmt::Write;

use castle_types::NodeRegistry;
use serde::Serialize;

use crate::routes::{local_routes, merge_routes, RemoteRoutes, RouteTable};

const HEADER: &str = "# Generated by castle from the node registry. Do not edit.\n";

/// A rendered Caddyfile together with the routes it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caddyfile {
    pub text: String,
    pub table: RouteTable,
}

/// Render the gateway config for `registry`, appending `remote` routes.
///
/// Remote routes whose prefix collides with a local route are dropped and
/// reported in [`RouteTable::warnings`].
pub fn generate_caddyfile(registry: &NodeRegistry, remote: Option<&RemoteRoutes>) -> Caddyfile {
    let table = merge_routes(local_routes(registry), remote.cloned().unwrap_or_default());

    let mut text = String::from(HEADER);
    let _ = writeln!(text, ":{} {{", registry.node.gateway_port);
    for route in &table.routes {
        let prefix = route.path_prefix.trim_end_matches('/');
        let _ = writeln!(text, "    handle_path {}/* {{", prefix);
        let _ = writeln!(text, "        reverse_proxy {}:{}", route.host, route.port);
        text.push_str("    }\n\n");
    }
    // the catch-all must follow every handle_path block
    if let Some(root) = registry.node.static_root.as_deref() {
        text.push_str("    handle {\n");
        let _ = writeln!(text, "        root * {}", root);
        text.push_str("        try_files {path} /index.html\n");
        text.push_str("        file_server\n");
        text.push_str("    }\n");
    }
    text.push_str("}\n");

    Caddyfile { text, table }
}
