//! [`Bus`] backed by an MQTT broker.
//!
//! Topics are exact names, never wildcard filters. Each topic is subscribed
//! at the broker once, on first local use, and again after every reconnect.
//! Incoming retained messages and our own retained publishes are cached so a
//! late local subscriber gets the same replay a fresh broker subscription
//! would.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusError, BusMessage, BusResult, Subscription};

pub const DEFAULT_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MqttBusError {
    #[error("unsupported broker uri `{0}`; expected mqtt://host[:port]")]
    UnsupportedScheme(String),
    #[error("broker uri `{0}` has no host")]
    MissingHost(String),
    #[error("invalid broker port `{0}`")]
    InvalidPort(String),
}

/// Broker address from `mqtt://host[:port]` or `tcp://host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    pub fn parse(uri: &str) -> Result<Self, MqttBusError> {
        let rest = uri
            .strip_prefix("mqtt://")
            .or_else(|| uri.strip_prefix("tcp://"))
            .ok_or_else(|| MqttBusError::UnsupportedScheme(uri.to_string()))?;
        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| MqttBusError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(MqttBusError::MissingHost(uri.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Debug, Default)]
struct Topics {
    senders: HashMap<String, broadcast::Sender<BusMessage>>,
    retained: HashMap<String, BusMessage>,
    connected: bool,
}

impl Topics {
    fn sender_for(&mut self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.senders
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(128).0)
            .clone()
    }

    /// Local subscription plus whether the broker must be asked for the
    /// topic right now. While disconnected the next ConnAck covers it.
    fn subscribe(&mut self, topic: &str) -> (Subscription, bool) {
        let first = !self.senders.contains_key(topic);
        let rx = self.sender_for(topic).subscribe();
        let sub = Subscription::new(self.retained.get(topic).cloned(), rx);
        (sub, first && self.connected)
    }

    fn remember(&mut self, msg: &BusMessage) {
        if !msg.retained {
            return;
        }
        if msg.payload.is_empty() {
            self.retained.remove(&msg.topic);
        } else {
            self.retained.insert(msg.topic.clone(), msg.clone());
        }
    }

    /// Caches and fans out one message from the broker.
    fn deliver(&mut self, msg: BusMessage) {
        self.remember(&msg);
        if let Some(sender) = self.senders.get(&msg.topic) {
            let _ = sender.send(msg);
        }
    }

    /// Marks the session up and returns every topic to resubscribe.
    fn connected(&mut self) -> Vec<String> {
        self.connected = true;
        self.senders.keys().cloned().collect()
    }
}

pub struct MqttBus {
    client: AsyncClient,
    topics: Arc<RwLock<Topics>>,
    eventloop: Mutex<Option<EventLoop>>,
    pump: OnceLock<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MqttBus {
    /// Prepares a session with `uri`. The connection itself is made by a
    /// background task started on first use, which reconnects until
    /// [`MqttBus::shutdown`].
    pub fn connect(uri: &str, client_id: &str) -> Result<Self, MqttBusError> {
        let addr = BrokerAddr::parse(uri)?;
        let mut options = MqttOptions::new(client_id, addr.host, addr.port);
        options
            .set_keep_alive(Duration::from_secs(5))
            .set_clean_session(true)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        Ok(Self::new(options))
    }

    pub fn new(options: MqttOptions) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            topics: Arc::new(RwLock::new(Topics::default())),
            eventloop: Mutex::new(Some(eventloop)),
            pump: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stops the background task and disconnects from the broker.
    pub fn shutdown(&self) {
        if let Err(err) = self.client.try_disconnect() {
            debug!(error = %err, "disconnect request not queued");
        }
        self.cancel.cancel();
    }

    fn ensure_pump(&self) {
        if self.pump.get().is_some() {
            return;
        }
        let Some(eventloop) = self.eventloop.lock().take() else {
            return;
        };
        let handle = tokio::spawn(pump(
            eventloop,
            self.client.clone(),
            Arc::clone(&self.topics),
            self.cancel.clone(),
        ));
        let _ = self.pump.set(handle);
    }
}

async fn pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Arc<RwLock<Topics>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let filters = topics.write().connected();
                info!(subscriptions = filters.len(), "connected to broker");
                for filter in filters {
                    if let Err(err) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(topic = %filter, error = %err, "resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                topics.write().deliver(BusMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    retained: publish.retain,
                });
            }
            Ok(_) => {}
            Err(err) => {
                topics.write().connected = false;
                warn!(error = %err, "broker connection lost; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!("mqtt pump stopped");
}

impl Bus for MqttBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        self.ensure_pump();
        let (sub, ask_broker) = self.topics.write().subscribe(topic);
        if ask_broker {
            if let Err(err) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                warn!(topic, error = %err, "subscribe request not queued");
            }
        }
        sub
    }

    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()> {
        self.ensure_pump();
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|err| BusError::Transport(err.to_string()))?;
        // The broker echoes to our own subscriptions; only the cache is local.
        self.topics.write().remember(&BusMessage {
            topic: topic.to_string(),
            payload,
            retained: retain,
        });
        Ok(())
    }
}
