//! LAN discovery over mDNS.
//!
//! Advertises this node as `_castle._tcp.local.` and browses for peers and
//! for an MQTT broker (`_mqtt._tcp.local.`). A discovered broker is handed to
//! the session through a `watch` channel; discovered peers are informational
//! only, since membership is decided by what arrives over the bus.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use castle_types::{CastleEvent, EventEnvelope, EventSource, Hostname, MeshEvent};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerAddress;
use crate::error::MeshResult;

pub const CASTLE_SERVICE_TYPE: &str = "_castle._tcp.local.";
pub const MQTT_SERVICE_TYPE: &str = "_mqtt._tcp.local.";

const DEFAULT_API_PORT: u16 = 9020;

/// A castle node seen on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPeer {
    pub hostname: Hostname,
    pub addresses: Vec<String>,
    pub gateway_port: u16,
    pub api_port: u16,
    /// Broker the peer is connected to, if it said.
    pub broker: Option<String>,
}

/// What this node advertises.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub hostname: Hostname,
    pub gateway_port: u16,
    pub api_port: u16,
    pub broker: Option<BrokerAddress>,
}

impl Advertisement {
    fn properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert("hostname".to_string(), self.hostname.to_string());
        props.insert("gateway_port".to_string(), self.gateway_port.to_string());
        props.insert("api_port".to_string(), self.api_port.to_string());
        if let Some(broker) = &self.broker {
            props.insert("broker".to_string(), broker.to_string());
        }
        props
    }

    fn service_info(&self) -> MeshResult<ServiceInfo> {
        let info = ServiceInfo::new(
            CASTLE_SERVICE_TYPE,
            self.hostname.as_str(),
            &self.hostname.as_mdns_host(),
            "",
            self.gateway_port,
            self.properties(),
        )?
        .enable_addr_auto();
        Ok(info)
    }
}

/// Instance name of a `_castle._tcp` fullname, `tower._castle._tcp.local.` -> `tower`.
pub fn instance_name(fullname: &str) -> &str {
    fullname
        .strip_suffix(CASTLE_SERVICE_TYPE)
        .map(|rest| rest.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// Build a peer record from TXT properties; `None` for ourselves or for
/// records without a hostname.
pub fn peer_from_txt(
    local: &Hostname,
    hostname: Option<&str>,
    addresses: &[IpAddr],
    gateway_port: Option<&str>,
    api_port: Option<&str>,
    broker: Option<&str>,
) -> Option<DiscoveredPeer> {
    let hostname = hostname.map(str::trim).filter(|h| !h.is_empty())?;
    if hostname == local.as_str() {
        return None;
    }
    let mut addresses: Vec<String> = addresses
        .iter()
        .filter(|a| a.is_ipv4())
        .map(IpAddr::to_string)
        .collect();
    addresses.sort();
    Some(DiscoveredPeer {
        hostname: Hostname::new(hostname),
        addresses,
        gateway_port: gateway_port
            .and_then(|p| p.parse().ok())
            .unwrap_or(castle_types::spec::DEFAULT_GATEWAY_PORT),
        api_port: api_port
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_API_PORT),
        broker: broker.map(String::from),
    })
}

/// First IPv4 address of a resolved broker.
pub fn broker_from_addresses(addresses: &[IpAddr], port: u16) -> Option<BrokerAddress> {
    let mut v4: Vec<&IpAddr> = addresses.iter().filter(|a| a.is_ipv4()).collect();
    v4.sort();
    v4.first().map(|addr| BrokerAddress {
        host: addr.to_string(),
        port,
    })
}

/// Handles for the running discovery task.
pub struct Discovery {
    pub peers: watch::Receiver<BTreeMap<Hostname, DiscoveredPeer>>,
    pub task: JoinHandle<()>,
}

/// Start advertising and browsing.
///
/// When `broker_tx` is given, the first broker found on the LAN and any later
/// change of address is sent through it.
pub fn spawn_discovery(
    advertisement: Advertisement,
    broker_tx: Option<watch::Sender<Option<BrokerAddress>>>,
    event_tx: broadcast::Sender<EventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) -> MeshResult<Discovery> {
    let daemon = ServiceDaemon::new()?;
    let info = advertisement.service_info()?;
    let fullname = info.get_fullname().to_string();
    daemon.register(info)?;
    info!(
        hostname = %advertisement.hostname,
        port = advertisement.gateway_port,
        "mDNS: advertising"
    );

    let castle_rx = daemon.browse(CASTLE_SERVICE_TYPE)?;
    let mqtt_rx = daemon.browse(MQTT_SERVICE_TYPE)?;
    let (peers_tx, peers_rx) = watch::channel(BTreeMap::new());
    let local = advertisement.hostname.clone();

    let task = tokio::spawn(async move {
        let emit = |event: MeshEvent| {
            let _ = event_tx.send(
                EventEnvelope::new(CastleEvent::Mesh(event), EventSource::Discovery)
                    .with_hostname(local.clone()),
            );
        };

        loop {
            tokio::select! {
                event = castle_rx.recv_async() => match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                        let Some(peer) = peer_from_txt(
                            &local,
                            info.get_property_val_str("hostname"),
                            &addresses,
                            info.get_property_val_str("gateway_port"),
                            info.get_property_val_str("api_port"),
                            info.get_property_val_str("broker"),
                        ) else {
                            continue;
                        };
                        let changed = peers_tx.send_if_modified(|peers| {
                            peers.insert(peer.hostname.clone(), peer.clone()).as_ref() != Some(&peer)
                        });
                        if changed {
                            info!(peer = %peer.hostname, addresses = ?peer.addresses, "mDNS: discovered peer");
                            emit(MeshEvent::PeerDiscovered {
                                hostname: peer.hostname.clone(),
                                addresses: peer.addresses.clone(),
                            });
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        let hostname = Hostname::new(instance_name(&fullname));
                        let removed = peers_tx.send_if_modified(|peers| peers.remove(&hostname).is_some());
                        if removed {
                            info!(peer = %hostname, "mDNS: peer removed");
                            emit(MeshEvent::PeerLost { hostname });
                        }
                    }
                    Ok(other) => debug!(event = ?other, "mDNS castle browse event"),
                    Err(e) => {
                        warn!(error = %e, "mDNS castle browse ended");
                        break;
                    }
                },
                event = mqtt_rx.recv_async() => match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                        let Some(broker) = broker_from_addresses(&addresses, info.get_port()) else {
                            continue;
                        };
                        let Some(tx) = broker_tx.as_ref() else {
                            continue;
                        };
                        let changed = tx.send_if_modified(|current| {
                            if current.as_ref() == Some(&broker) {
                                return false;
                            }
                            *current = Some(broker.clone());
                            true
                        });
                        if changed {
                            info!(broker = %broker, "mDNS: discovered MQTT broker");
                            emit(MeshEvent::BrokerDiscovered {
                                host: broker.host.clone(),
                                port: broker.port,
                            });
                        }
                    }
                    Ok(other) => debug!(event = ?other, "mDNS broker browse event"),
                    Err(e) => {
                        warn!(error = %e, "mDNS broker browse ended");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = daemon.unregister(&fullname) {
            debug!(error = %e, "mDNS: unregister failed");
        }
        if let Err(e) = daemon.shutdown() {
            debug!(error = %e, "mDNS: daemon shutdown failed");
        }
        info!("mDNS: stopped");
    });

    Ok(Discovery {
        peers: peers_rx,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("tower._castle._tcp.local."), "tower");
        assert_eq!(instance_name("tower"), "tower");
    }

    #[test]
    fn test_peer_from_txt() {
        let local = Hostname::new("a");
        let addresses = [
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
        ];
        let peer = peer_from_txt(&local, Some("b"), &addresses, Some("9100"), None, None).unwrap();
        assert_eq!(peer.hostname, Hostname::new("b"));
        assert_eq!(peer.addresses, vec!["192.168.1.20"]);
        assert_eq!(peer.gateway_port, 9100);
        assert_eq!(peer.api_port, 9020);

        assert!(peer_from_txt(&local, Some("a"), &addresses, None, None, None).is_none());
        assert!(peer_from_txt(&local, None, &addresses, None, None, None).is_none());
        assert!(peer_from_txt(&local, Some(" "), &addresses, None, None, None).is_none());
    }

    #[test]
    fn test_broker_from_addresses() {
        let addresses = [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        ];
        assert_eq!(
            broker_from_addresses(&addresses, 1883),
            Some(BrokerAddress {
                host: "10.0.0.2".into(),
                port: 1883
            })
        );
        assert_eq!(
            broker_from_addresses(&[IpAddr::V6(Ipv6Addr::LOCALHOST)], 1883),
            None
        );
    }

    #[test]
    fn test_advertised_properties() {
        let ad = Advertisement {
            hostname: Hostname::new("tower"),
            gateway_port: 9000,
            api_port: 9020,
            broker: Some(BrokerAddress {
                host: "10.0.0.2".into(),
                port: 1883,
            }),
        };
        let props = ad.properties();
        assert_eq!(props["hostname"], "tower");
        assert_eq!(props["gateway_port"], "9000");
        assert_eq!(props["broker"], "10.0.0.2:1883");
    }
}
