//! Gateway route computation.
//!
//! Routes are derived fresh from the local registry and a snapshot of remote
//! registries on every call. Local routes always come first; a remote route
//! whose prefix collides with an earlier route is dropped with a warning.
//! A peer entry bound to loopback cannot be reached from here and is skipped.

use std::collections::BTreeMap;

use castle_types::{Hostname, NodeRegistry, PublicEntry, RemoteRegistry};
use serde::Serialize;

/// One `handle_path` block in the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayRoute {
    pub path_prefix: String,
    pub host: String,
    pub port: u16,
    pub component: String,
    pub node: Hostname,
    pub local: bool,
}

/// A route dropped because its prefix was already taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteCollision {
    pub path_prefix: String,
    pub kept: Hostname,
    pub dropped: Hostname,
    pub component: String,
}

impl std::fmt::Display for RouteCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "route {} for {} on {} dropped: prefix already served by {}",
            self.path_prefix, self.component, self.dropped, self.kept
        )
    }
}

/// A peer route with no upstream this node can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreachableRoute {
    pub path_prefix: String,
    pub node: Hostname,
    pub component: String,
    pub reason: String,
}

impl std::fmt::Display for UnreachableRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "route {} for {} on {} skipped: {}",
            self.path_prefix, self.component, self.node, self.reason
        )
    }
}

/// Routes offered by peers, plus the ones that had to be skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteRoutes {
    pub routes: Vec<GatewayRoute>,
    pub unreachable: Vec<UnreachableRoute>,
}

/// The merged routing table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteTable {
    pub routes: Vec<GatewayRoute>,
    pub warnings: Vec<RouteCollision>,
    pub unreachable: Vec<UnreachableRoute>,
}

impl RouteTable {
    pub fn find(&self, path_prefix: &str) -> Option<&GatewayRoute> {
        let key = normalize(path_prefix);
        self.routes.iter().find(|r| normalize(&r.path_prefix) == key)
    }

    /// Every dropped or skipped route, rendered for logs and reports.
    pub fn messages(&self) -> Vec<String> {
        self.warnings
            .iter()
            .map(ToString::to_string)
            .chain(self.unreachable.iter().map(ToString::to_string))
            .collect()
    }
}

/// Routes served by this node, in entry name order.
pub fn local_routes(registry: &NodeRegistry) -> Vec<GatewayRoute> {
    registry
        .deployed
        .iter()
        .filter_map(|(name, entry)| {
            Some(GatewayRoute {
                path_prefix: entry.proxy_path.clone()?,
                host: entry.upstream_host().to_string(),
                port: entry.port?,
                component: name.clone(),
                node: registry.node.hostname.clone(),
                local: true,
            })
        })
        .collect()
}

/// Routes published by online peers, ordered by hostname then entry name.
///
/// A peer entry is reached on its bind address, or on the peer hostname when
/// it listens on every interface. `remote` runner entries go straight to
/// their `base_url`.
pub fn remote_routes<'a, I>(remotes: I) -> RemoteRoutes
where
    I: IntoIterator<Item = &'a RemoteRegistry>,
{
    let by_host: BTreeMap<&Hostname, &RemoteRegistry> = remotes
        .into_iter()
        .filter(|r| r.online)
        .map(|r| (&r.hostname, r))
        .collect();

    let mut out = RemoteRoutes::default();
    for (hostname, remote) in by_host {
        for (name, entry) in &remote.registry.deployed {
            let Some(prefix) = &entry.proxy_path else {
                continue;
            };
            match peer_upstream(hostname, entry) {
                Ok(Some((host, port))) => out.routes.push(GatewayRoute {
                    path_prefix: prefix.clone(),
                    host,
                    port,
                    component: name.clone(),
                    node: hostname.clone(),
                    local: false,
                }),
                Ok(None) => {}
                Err(reason) => out.unreachable.push(UnreachableRoute {
                    path_prefix: prefix.clone(),
                    node: hostname.clone(),
                    component: name.clone(),
                    reason,
                }),
            }
        }
    }
    out
}

/// Local routes followed by remote routes, first route per prefix wins.
pub fn merge_routes(local: Vec<GatewayRoute>, remote: RemoteRoutes) -> RouteTable {
    let mut table = RouteTable {
        unreachable: remote.unreachable,
        ..RouteTable::default()
    };
    let mut owners: BTreeMap<String, Hostname> = BTreeMap::new();

    for route in local.into_iter().chain(remote.routes) {
        let key = normalize(&route.path_prefix);
        if let Some(kept) = owners.get(&key) {
            table.warnings.push(RouteCollision {
                path_prefix: route.path_prefix.clone(),
                kept: kept.clone(),
                dropped: route.node.clone(),
                component: route.component.clone(),
            });
            continue;
        }
        owners.insert(key, route.node.clone());
        table.routes.push(route);
    }
    table
}

/// Full table for a registry and a remote snapshot.
pub fn route_table<'a, I>(registry: &NodeRegistry, remotes: I) -> RouteTable
where
    I: IntoIterator<Item = &'a RemoteRegistry>,
{
    merge_routes(local_routes(registry), remote_routes(remotes))
}

/// `Ok(None)` for entries without a port to forward to.
fn peer_upstream(peer: &Hostname, entry: &PublicEntry) -> Result<Option<(String, u16)>, String> {
    if let Some(base_url) = &entry.base_url {
        let url = url::Url::parse(base_url)
            .map_err(|e| format!("invalid base_url {:?}: {}", base_url, e))?;
        let host = url
            .host_str()
            .ok_or_else(|| format!("base_url {:?} has no host", base_url))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("base_url {:?} has no port", base_url))?;
        return Ok(Some((host.to_string(), port)));
    }

    let Some(port) = entry.port else {
        return Ok(None);
    };
    match entry.host.as_deref().map(str::trim) {
        None | Some("") | Some("0.0.0.0") | Some("::") | Some("[::]") => {
            Ok(Some((peer.to_string(), port)))
        }
        Some(host) if is_loopback(host) => Err(format!("bound to {} on the peer", host)),
        Some(host) => Ok(Some((host.to_string(), port))),
    }
}

fn is_loopback(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost")
        || bare
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn normalize(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_types::{
        DeployedEntry, EntryKind, NodeConfig, PublicRegistry, RemoteTarget, RunnerKind,
    };
    use chrono::Utc;

    fn entry(port: u16, proxy: Option<&str>) -> DeployedEntry {
        DeployedEntry {
            kind: EntryKind::Service,
            runner: RunnerKind::Command,
            description: None,
            run_cmd: vec!["/usr/bin/x".into()],
            env: Default::default(),
            host: Some("127.0.0.1".into()),
            port: Some(port),
            health_path: None,
            proxy_path: proxy.map(String::from),
            remote: None,
            schedule: None,
            timezone: None,
            managed: true,
            supervision: None,
        }
    }

    /// An entry listening on every interface, reachable from other nodes.
    fn shared(port: u16, proxy: Option<&str>) -> DeployedEntry {
        DeployedEntry {
            host: Some("0.0.0.0".into()),
            ..entry(port, proxy)
        }
    }

    fn registry(host: &str, entries: Vec<(&str, DeployedEntry)>) -> NodeRegistry {
        NodeRegistry {
            node: NodeConfig {
                hostname: Hostname::new(host),
                gateway_port: 9000,
                static_root: None,
            },
            deployed: entries
                .into_iter()
                .map(|(n, e)| (n.to_string(), e))
                .collect(),
        }
    }

    fn remote(reg: &NodeRegistry, online: bool) -> RemoteRegistry {
        let public: PublicRegistry = reg.public_view();
        RemoteRegistry {
            hostname: reg.node.hostname.clone(),
            registry: public,
            received_at: Utc::now(),
            online,
        }
    }

    #[test]
    fn test_local_wins_on_collision() {
        let a = registry("a", vec![("x", entry(9001, Some("/x")))]);
        let b = registry("b", vec![("x", shared(9002, Some("/x")))]);

        let table = route_table(&a, [&remote(&b, true)]);
        assert_eq!(table.routes.len(), 1);
        let route = table.find("/x").unwrap();
        assert!(route.local);
        assert_eq!(route.port, 9001);
        assert_eq!(route.node, Hostname::new("a"));

        assert_eq!(table.warnings.len(), 1);
        assert_eq!(table.warnings[0].kept, Hostname::new("a"));
        assert_eq!(table.warnings[0].dropped, Hostname::new("b"));
    }

    #[test]
    fn test_remote_only_routes_target_peer() {
        let a = registry("a", vec![("x", entry(9001, Some("/x")))]);
        let b = registry("b", vec![("photos", shared(2342, Some("/photos")))]);

        let table = route_table(&a, [&remote(&b, true)]);
        let photos = table.find("/photos/").unwrap();
        assert_eq!(photos.host, "b");
        assert_eq!(photos.port, 2342);
        assert!(!photos.local);
        assert!(table.warnings.is_empty());
        assert!(table.unreachable.is_empty());
    }

    #[test]
    fn test_remote_bound_to_lan_address_keeps_it() {
        let mut lan = shared(2342, Some("/photos"));
        lan.host = Some("192.168.1.20".into());
        let b = registry("b", vec![("photos", lan)]);

        let table = route_table(&registry("a", vec![]), [&remote(&b, true)]);
        assert_eq!(table.find("/photos").unwrap().host, "192.168.1.20");
    }

    #[test]
    fn test_loopback_remote_is_skipped_with_warning() {
        let a = registry("a", vec![]);
        let b = registry(
            "b",
            vec![
                ("photos", entry(2342, Some("/photos"))),
                ("wiki", shared(8080, Some("/wiki"))),
            ],
        );

        let table = route_table(&a, [&remote(&b, true)]);
        assert!(table.find("/photos").is_none());
        assert!(table.find("/wiki").is_some());
        assert!(table.warnings.is_empty());

        assert_eq!(table.unreachable.len(), 1);
        let skipped = &table.unreachable[0];
        assert_eq!(skipped.node, Hostname::new("b"));
        assert_eq!(skipped.component, "photos");
        assert!(table.messages()[0].contains("bound to 127.0.0.1"));
    }

    #[test]
    fn test_remote_runner_routes_to_base_url() {
        let mut far = entry(5000, Some("/nas"));
        far.runner = RunnerKind::Remote;
        far.run_cmd = Vec::new();
        far.managed = false;
        far.remote = Some(RemoteTarget {
            base_url: "http://nas.lan:5000/app".into(),
            health_url: None,
        });
        let b = registry("b", vec![("nas", far)]);

        let table = route_table(&registry("a", vec![]), [&remote(&b, true)]);
        let nas = table.find("/nas").unwrap();
        assert_eq!(nas.host, "nas.lan");
        assert_eq!(nas.port, 5000);
        assert!(table.unreachable.is_empty());
    }

    #[test]
    fn test_offline_peers_excluded() {
        let a = registry("a", vec![]);
        let b = registry("b", vec![("photos", shared(2342, Some("/photos")))]);
        let table = route_table(&a, [&remote(&b, false)]);
        assert!(table.routes.is_empty());
    }

    #[test]
    fn test_remote_collisions_first_hostname_wins() {
        let a = registry("a", vec![]);
        let c = registry("c", vec![("wiki", shared(8080, Some("/wiki")))]);
        let b = registry("b", vec![("wiki", shared(8081, Some("/wiki")))]);

        let table = route_table(&a, [&remote(&c, true), &remote(&b, true)]);
        assert_eq!(table.find("/wiki").unwrap().node, Hostname::new("b"));
        assert_eq!(table.warnings[0].dropped, Hostname::new("c"));
    }

    #[test]
    fn test_unproxied_entries_have_no_route() {
        let a = registry("a", vec![("db", entry(5432, None))]);
        assert!(local_routes(&a).is_empty());
    }

    #[test]
    fn test_unbound_local_entry_uses_default_host() {
        let mut unbound = entry(9001, Some("/x"));
        unbound.host = None;
        let routes = local_routes(&registry("a", vec![("x", unbound)]));
        assert_eq!(routes[0].host, castle_types::DEFAULT_UPSTREAM_HOST);
    }
}
