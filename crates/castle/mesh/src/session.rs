//! The bus session.
//!
//! Owns the MQTT connection for this node. On every ConnAck it announces
//! `online`, republishes the local registry and resubscribes, so a broker
//! restart or a network blip heals without outside help. The last will makes
//! the broker publish `offline` for us when the connection dies uncleanly.

use castle_types::{CastleEvent, EventEnvelope, EventSource, MeshEvent, NodeRegistry};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{BrokerAddress, MeshConfig};
use crate::error::MeshResult;
use crate::state::{Inbound, MeshCommand};
use crate::topic::{
    decode_presence, decode_registry, encode_registry, TopicKind, Topics, OFFLINE, ONLINE,
};

/// Time allowed for the offline marker and DISCONNECT to reach the broker.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection state as reported to the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub connected: bool,
    pub broker: Option<BrokerAddress>,
    pub since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A request queued on the bus client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Retained presence marker on our status topic.
    Presence(&'static str),
    /// Retained public registry on our registry topic.
    Registry(Vec<u8>),
    Subscribe(String),
}

enum SessionEnd {
    Shutdown,
    BrokerChanged,
}

/// Decode a message received on one of the subscribed filters.
///
/// `Ok(None)` for topics outside the mesh layout and unknown presence
/// payloads.
pub fn decode_message(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> MeshResult<Option<Inbound>> {
    let Some((hostname, kind)) = topics.parse(topic) else {
        return Ok(None);
    };
    Ok(match kind {
        TopicKind::Registry => Some(Inbound::Registry {
            hostname,
            registry: decode_registry(topic, payload)?,
        }),
        TopicKind::Status => {
            decode_presence(payload).map(|online| Inbound::Presence { hostname, online })
        }
    })
}

pub struct MeshSession {
    config: MeshConfig,
    topics: Topics,
    registry: watch::Receiver<NodeRegistry>,
    broker: watch::Receiver<Option<BrokerAddress>>,
    commands: mpsc::Sender<MeshCommand>,
    status_tx: watch::Sender<BrokerStatus>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl MeshSession {
    pub fn new(
        config: MeshConfig,
        topics: Topics,
        registry: watch::Receiver<NodeRegistry>,
        broker: watch::Receiver<Option<BrokerAddress>>,
        commands: mpsc::Sender<MeshCommand>,
        status_tx: watch::Sender<BrokerStatus>,
        event_tx: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        Self {
            config,
            topics,
            registry,
            broker,
            commands,
            status_tx,
            event_tx,
        }
    }

    /// Connect, serve and reconnect until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let Some(broker) = self.wait_for_broker(&mut shutdown).await else {
                break;
            };
            match self.serve(broker, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::BrokerChanged => continue,
            }
        }
        self.status_tx.send_modify(|s| s.connected = false);
        debug!("Mesh session stopped");
    }

    async fn wait_for_broker(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<BrokerAddress> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(broker) = self.broker.borrow_and_update().clone() {
                return Some(broker);
            }
            debug!("Mesh session waiting for a broker address");
            tokio::select! {
                changed = self.broker.changed() => {
                    if changed.is_err() {
                        // nobody can hand us a broker any more
                        let _ = shutdown.wait_for(|stop| *stop).await;
                        return None;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn options(&self, broker: &BrokerAddress) -> MqttOptions {
        let mut options =
            MqttOptions::new(self.topics.client_id(), broker.host.clone(), broker.port);
        options
            .set_keep_alive(self.config.keep_alive())
            .set_clean_session(true);
        if self.config.publish {
            options.set_last_will(LastWill::new(
                self.topics.status(),
                OFFLINE,
                QoS::AtLeastOnce,
                true,
            ));
        }
        options
    }

    async fn serve(
        &mut self,
        broker: BrokerAddress,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (client, mut eventloop) = AsyncClient::new(self.options(&broker), 64);
        let mut backoff = self.config.reconnect_min();
        let mut connected = false;
        let mut registry_open = true;
        let mut broker_open = true;

        let mut republish = interval(self.config.republish_interval());
        republish.set_missed_tick_behavior(MissedTickBehavior::Delay);
        republish.tick().await;

        info!(broker = %broker, client_id = %self.topics.client_id(), "Mesh session connecting");

        loop {
            tokio::select! {
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected = true;
                        backoff = self.config.reconnect_min();
                        if let Err(e) = self.announce(&client).await {
                            warn!(error = %e, "Mesh announce failed");
                        }
                        self.status_tx.send_replace(BrokerStatus {
                            connected: true,
                            broker: Some(broker.clone()),
                            since: Some(Utc::now()),
                            last_error: None,
                        });
                        info!(broker = %broker, "Mesh bus connected");
                        self.emit(MeshEvent::BrokerConnected {
                            host: broker.host.clone(),
                            port: broker.port,
                        });
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.receive(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = e.to_string();
                        if connected {
                            connected = false;
                            self.emit(MeshEvent::BrokerDisconnected {
                                reason: reason.clone(),
                            });
                        }
                        self.status_tx.send_replace(BrokerStatus {
                            connected: false,
                            broker: Some(broker.clone()),
                            since: Some(Utc::now()),
                            last_error: Some(reason.clone()),
                        });
                        warn!(
                            broker = %broker,
                            error = %reason,
                            retry_in_ms = backoff.as_millis() as u64,
                            "Mesh bus connection failed"
                        );

                        tokio::select! {
                            _ = sleep(backoff) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        backoff = (backoff * 2).min(self.config.reconnect_max());
                    }
                },
                changed = self.registry.changed(), if registry_open => {
                    if changed.is_err() {
                        registry_open = false;
                    } else if connected && self.config.publish {
                        if let Err(e) = self.publish_registry(&client).await {
                            warn!(error = %e, "Mesh registry publish failed");
                        }
                    }
                }
                _ = republish.tick() => {
                    if connected && self.config.publish {
                        if let Err(e) = self.publish_registry(&client).await {
                            warn!(error = %e, "Mesh registry republish failed");
                        }
                    }
                }
                changed = self.broker.changed(), if broker_open => {
                    if changed.is_err() {
                        broker_open = false;
                    } else if self.broker.borrow().as_ref() != Some(&broker) {
                        info!(from = %broker, "Mesh broker address changed");
                        self.go_offline(&client, &mut eventloop, connected).await;
                        return SessionEnd::BrokerChanged;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.go_offline(&client, &mut eventloop, connected).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Requests sent after every ConnAck: presence and registry when
    /// publishing, then the subscriptions when subscribing.
    pub fn announcement(&mut self) -> MeshResult<Vec<Outbound>> {
        let mut requests = Vec::new();
        if self.config.publish {
            requests.push(Outbound::Presence(ONLINE));
            requests.push(Outbound::Registry(self.registry_payload()?));
        }
        if self.config.subscribe {
            requests.push(Outbound::Subscribe(self.topics.registry_filter()));
            requests.push(Outbound::Subscribe(self.topics.status_filter()));
        }
        Ok(requests)
    }

    async fn announce(&mut self, client: &AsyncClient) -> MeshResult<()> {
        for request in self.announcement()? {
            self.send(client, request).await?;
        }
        Ok(())
    }

    async fn publish_registry(&mut self, client: &AsyncClient) -> MeshResult<()> {
        let payload = self.registry_payload()?;
        self.send(client, Outbound::Registry(payload)).await
    }

    fn registry_payload(&mut self) -> MeshResult<Vec<u8>> {
        let registry = self.registry.borrow_and_update();
        let payload = encode_registry(&registry.public_view())?;
        debug!(entries = registry.deployed.len(), "Encoded registry");
        Ok(payload)
    }

    async fn send(&self, client: &AsyncClient, request: Outbound) -> MeshResult<()> {
        match request {
            Outbound::Presence(marker) => {
                client
                    .publish(self.topics.status(), QoS::AtLeastOnce, true, marker)
                    .await?
            }
            Outbound::Registry(payload) => {
                client
                    .publish(self.topics.registry(), QoS::AtLeastOnce, true, payload)
                    .await?
            }
            Outbound::Subscribe(filter) => client.subscribe(filter, QoS::AtLeastOnce).await?,
        }
        Ok(())
    }

    async fn receive(&self, topic: &str, payload: &[u8]) {
        match decode_message(&self.topics, topic, payload) {
            Ok(Some(message)) => {
                if self.commands.send(MeshCommand::Apply(message)).await.is_err() {
                    debug!("Mesh state task gone; dropping message");
                }
            }
            Ok(None) => debug!(topic, "Ignoring message"),
            Err(e) => warn!(error = %e, "Dropping malformed mesh message"),
        }
    }

    async fn go_offline(&self, client: &AsyncClient, eventloop: &mut EventLoop, connected: bool) {
        if !connected {
            return;
        }
        let sent = async {
            if self.config.publish {
                self.send(client, Outbound::Presence(OFFLINE)).await?;
            }
            client.disconnect().await?;
            MeshResult::Ok(())
        }
        .await;
        if let Err(e) = sent {
            warn!(error = %e, "Could not queue offline marker");
            return;
        }

        // the requests only leave once the event loop is polled
        let flushed = tokio::time::timeout(SHUTDOWN_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        match flushed {
            Ok(()) => info!("Mesh session announced offline"),
            Err(_) => warn!("Timed out flushing offline marker"),
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.event_tx.send(
            EventEnvelope::new(CastleEvent::Mesh(event), EventSource::Mesh)
                .with_hostname(self.topics.hostname().clone()),
        );
    }
}
