//! Message bus link
//!
//! Publishes local mesh traffic to `{root}/{meshId}` and delivers traffic
//! from `{root}/+` to the bridge. Message bodies are base64 text.
//!
//! The broker is reached through [`BusConnector`], which yields a fresh
//! [`BusSession`] per connection. A [`BusSupervisor`] task owns the
//! session: it connects, subscribes, pumps inbound deliveries and
//! reconnects with backoff when the session ends. [`BusLink`] is the
//! clonable publish handle used by the rest of the bridge.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{ConnectionState, Reconnector};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusDelivery {
    /// Topic the message was published on
    pub topic: String,
    /// Raw message body
    pub body: Bytes,
}

/// Packet attributed to a mesh, decoded from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessage {
    /// Mesh the packet originated from
    pub mesh_id: String,
    /// Raw packet bytes
    pub payload: Bytes,
}

/// Outbound half of a broker session
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Publish a message body
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()>;

    /// End the session cleanly
    async fn disconnect(&self) -> Result<()>;
}

/// Inbound half of a broker session
#[async_trait]
pub trait BusInbound: Send {
    /// Wait for the next delivery; an error means the session is gone
    async fn recv(&mut self) -> Result<BusDelivery>;
}

/// One connected broker session
pub struct BusSession {
    /// Publish side, shared with the publish handle
    pub publisher: Arc<dyn BusPublisher>,
    /// Delivery side, owned by the supervisor
    pub inbound: Box<dyn BusInbound>,
}

impl fmt::Debug for BusSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSession").finish_non_exhaustive()
    }
}

/// Opens broker sessions
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connect and return a ready session
    async fn connect(&self) -> Result<BusSession>;

    /// Broker name for logging
    fn name(&self) -> String;
}

/// Extract the mesh id from `{root}/{meshId}`
///
/// Returns `None` for topics outside the root or with extra levels.
pub fn parse_mesh_topic<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    let mesh_id = topic.strip_prefix(root)?.strip_prefix('/')?;
    if mesh_id.is_empty() || mesh_id.contains('/') {
        return None;
    }
    Some(mesh_id)
}

/// Encode a packet as a message body
pub fn encode_body(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decode a message body, ignoring surrounding whitespace
pub fn decode_body(body: &[u8]) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let end = body
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    STANDARD.decode(&body[start..end])
}

/// Counters for the bus link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Successful broker sessions
    pub connects: u64,
    /// Messages handed to the broker
    pub published: u64,
    /// Messages dropped because no session was up or the publish failed
    pub publish_dropped: u64,
    /// Deliveries decoded and forwarded to the bridge
    pub received: u64,
    /// Deliveries dropped for a bad topic or body
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct BusCounters {
    connects: AtomicU64,
    published: AtomicU64,
    publish_dropped: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
}

impl BusCounters {
    fn snapshot(&self) -> BusStats {
        BusStats {
            connects: self.connects.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

type PublisherSlot = Arc<RwLock<Option<Arc<dyn BusPublisher>>>>;

/// Publish handle for the message bus
#[derive(Clone)]
pub struct BusLink {
    root_topic: Arc<str>,
    publisher: PublisherSlot,
    state: watch::Receiver<ConnectionState>,
    counters: Arc<BusCounters>,
}

impl BusLink {
    /// Create the link and the supervisor that keeps it connected
    ///
    /// Decoded deliveries are sent to `inbound`. The supervisor must be
    /// driven with [`BusSupervisor::run`].
    pub fn new(
        config: &BridgeConfig,
        connector: Arc<dyn BusConnector>,
        inbound: mpsc::Sender<MeshMessage>,
        cancel: CancellationToken,
    ) -> (BusLink, BusSupervisor) {
        let root_topic: Arc<str> = config.mqtt.root_topic.as_str().into();
        let publisher: PublisherSlot = Arc::new(RwLock::new(None));
        let counters = Arc::new(BusCounters::default());
        let reconnector = Reconnector::new("bus", &config.reconnect.bus);

        let link = BusLink {
            root_topic: root_topic.clone(),
            publisher: publisher.clone(),
            state: reconnector.subscribe(),
            counters: counters.clone(),
        };

        let supervisor = BusSupervisor {
            connector,
            reconnector,
            root_topic,
            filter: config.subscribe_filter(),
            publisher,
            inbound,
            cancel,
            counters,
        };

        (link, supervisor)
    }

    /// Publish a packet from `mesh_id` to `{root}/{mesh_id}`
    ///
    /// Failures are logged and counted, never returned. Returns whether
    /// the message was handed to the broker.
    pub async fn publish(&self, mesh_id: &str, payload: &[u8]) -> bool {
        let topic = format!("{}/{}", self.root_topic, mesh_id);
        let publisher = self.publisher.read().clone();
        let Some(publisher) = publisher else {
            self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%topic, "Broker not connected, dropping message");
            return false;
        };

        let body = Bytes::from(encode_body(payload));
        match publisher.publish(&topic, body).await {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                trace!(%topic, size = payload.len(), "Published to bus");
                true
            }
            Err(e) => {
                self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%topic, error = %e, "Publish failed, dropping message");
                false
            }
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Root topic
    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    /// Link counters
    pub fn stats(&self) -> BusStats {
        self.counters.snapshot()
    }
}

impl fmt::Debug for BusLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusLink")
            .field("root_topic", &self.root_topic)
            .field("state", &self.state())
            .finish()
    }
}

/// Keeps the broker session alive and pumps inbound deliveries
pub struct BusSupervisor {
    connector: Arc<dyn BusConnector>,
    reconnector: Reconnector,
    root_topic: Arc<str>,
    filter: String,
    publisher: PublisherSlot,
    inbound: mpsc::Sender<MeshMessage>,
    cancel: CancellationToken,
    counters: Arc<BusCounters>,
}

impl BusSupervisor {
    /// Run until cancelled or the inbound receiver is dropped
    pub async fn run(mut self) {
        let broker = self.connector.name();
        info!(%broker, filter = %self.filter, "Bus link starting");

        loop {
            let connector = self.connector.clone();
            let slot = self.publisher.clone();
            let filter = self.filter.clone();
            let inbound = self
                .reconnector
                .establish(&self.cancel, || {
                    let connector = connector.clone();
                    let slot = slot.clone();
                    let filter = filter.clone();
                    async move {
                        let BusSession { publisher, inbound } = connector.connect().await?;
                        if let Err(e) = publisher.subscribe(&filter).await {
                            let _ = publisher.disconnect().await;
                            return Err(e);
                        }
                        *slot.write() = Some(publisher);
                        Ok::<_, BridgeError>(inbound)
                    }
                })
                .await;
            let Some(mut inbound) = inbound else {
                break;
            };

            self.counters.connects.fetch_add(1, Ordering::Relaxed);
            info!(%broker, filter = %self.filter, "Connected to broker");

            let lost = self.pump(inbound.as_mut()).await;
            drop(inbound);
            let publisher = self.publisher.write().take();

            match lost {
                None => {
                    if let Some(publisher) = publisher {
                        if let Err(e) = publisher.disconnect().await {
                            debug!(error = %e, "Error disconnecting from broker");
                        }
                    }
                    break;
                }
                Some(e) => {
                    warn!(%broker, error = %e, "Broker connection lost, will reconnect");
                    self.reconnector.mark_disconnected();
                    if !self.reconnector.back_off(&self.cancel).await {
                        break;
                    }
                }
            }
        }

        self.reconnector.mark_disconnected();
        info!(%broker, "Bus link stopped");
    }

    /// Forward deliveries until the session fails
    ///
    /// Returns the session error, or `None` when the link should stop.
    async fn pump(&mut self, inbound: &mut dyn BusInbound) -> Option<BridgeError> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                delivery = inbound.recv() => delivery,
            };

            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => return Some(e),
            };

            let message = match self.decode(delivery) {
                Ok(message) => message,
                Err(e) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping malformed bus message");
                    continue;
                }
            };

            trace!(mesh_id = %message.mesh_id, size = message.payload.len(), "Received from bus");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                sent = self.inbound.send(message) => {
                    if sent.is_err() {
                        debug!("Inbound receiver dropped, stopping bus link");
                        return None;
                    }
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn decode(&self, delivery: BusDelivery) -> Result<MeshMessage> {
        let mesh_id = parse_mesh_topic(&self.root_topic, &delivery.topic)
            .ok_or_else(|| BridgeError::InvalidTopic(delivery.topic.clone()))?;
        let payload = decode_body(&delivery.body).map_err(|e| BridgeError::InvalidBase64 {
            topic: delivery.topic.clone(),
            reason: e.to_string(),
        })?;
        Ok(MeshMessage {
            mesh_id: mesh_id.to_string(),
            payload: Bytes::from(payload),
        })
    }
}

impl fmt::Debug for BusSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSupervisor")
            .field("filter", &self.filter)
            .field("state", &self.reconnector.state())
            .finish()
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt::MqttConnector;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::*;
    use rumqttc::{
        AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubAck,
        SubscribeReasonCode,
    };
    use std::time::Duration;

    /// Request queue depth between the client handle and the event loop
    const REQUEST_CAPACITY: usize = 64;

    /// Connects to an MQTT broker with rumqttc
    #[derive(Debug, Clone)]
    pub struct MqttConnector {
        host: String,
        port: u16,
        client_id: String,
        credentials: Option<(String, String)>,
        keep_alive: Duration,
    }

    impl MqttConnector {
        /// Build from bridge configuration
        pub fn from_config(config: &BridgeConfig) -> Self {
            let credentials = config.mqtt.username.clone().map(|username| {
                (username, config.mqtt.password.clone().unwrap_or_default())
            });
            Self {
                host: config.mqtt.broker.clone(),
                port: config.mqtt.port,
                client_id: config.client_id(),
                credentials,
                keep_alive: config.mqtt.keep_alive,
            }
        }

        fn options(&self) -> MqttOptions {
            let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
            options.set_keep_alive(self.keep_alive);
            options.set_clean_session(true);
            if let Some((username, password)) = &self.credentials {
                options.set_credentials(username, password);
            }
            options
        }
    }

    #[async_trait]
    impl BusConnector for MqttConnector {
        async fn connect(&self) -> Result<BusSession> {
            let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            break;
                        }
                        return Err(BridgeError::BrokerConnectFailed {
                            broker: self.name(),
                            reason: format!("{:?}", ack.code),
                        });
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(BridgeError::BrokerConnectFailed {
                            broker: self.name(),
                            reason: e.to_string(),
                        })
                    }
                }
            }

            Ok(BusSession {
                publisher: Arc::new(MqttPublisher { client }),
                inbound: Box::new(MqttInbound { eventloop }),
            })
        }

        fn name(&self) -> String {
            format!("mqtt://{}:{}", self.host, self.port)
        }
    }

    struct MqttPublisher {
        client: AsyncClient,
    }

    #[async_trait]
    impl BusPublisher for MqttPublisher {
        async fn subscribe(&self, filter: &str) -> Result<()> {
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| BridgeError::SubscribeFailed {
                    filter: filter.to_string(),
                    reason: e.to_string(),
                })
        }

        async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, body.to_vec())
                .await
                .map_err(|e| BridgeError::PublishFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        }

        async fn disconnect(&self) -> Result<()> {
            self.client
                .disconnect()
                .await
                .map_err(|e| BridgeError::BrokerDisconnected(e.to_string()))
        }
    }

    /// A refused subscription leaves the session connected but deaf
    pub(super) fn check_suback(ack: &SubAck) -> Result<()> {
        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(BridgeError::SubscribeFailed {
                filter: format!("packet {}", ack.pkid),
                reason: "broker refused subscription".to_string(),
            });
        }
        Ok(())
    }

    struct MqttInbound {
        eventloop: EventLoop,
    }

    #[async_trait]
    impl BusInbound for MqttInbound {
        async fn recv(&mut self) -> Result<BusDelivery> {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        return Ok(BusDelivery {
                            topic: publish.topic,
                            body: publish.payload,
                        })
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => check_suback(&ack)?,
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        return Err(BridgeError::BrokerDisconnected(
                            "broker sent disconnect".to_string(),
                        ))
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(BridgeError::BrokerDisconnected(e.to_string())),
                }
            }
        }
    }
}
