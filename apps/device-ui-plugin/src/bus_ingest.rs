use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusError, BusMessage, Subscription};

use crate::bus_publisher::UiPublisher;
use crate::host::StepOptions;
use crate::settings::WireSettings;

pub const TOPIC_SETTINGS_REPLY: &str = "microdrop/dmf-device-ui/get-video-settings";
pub const TOPIC_UPDATE_PROTOCOL: &str = "microdrop/dmf-device-ui/update-protocol";

pub const INBOUND_TOPICS: &[&str] = &[TOPIC_SETTINGS_REPLY, TOPIC_UPDATE_PROTOCOL];

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Receiver of decoded inbound worker messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// The worker reported its settings; `None` when it sent `null`.
    async fn on_settings_reply(&self, settings: Option<WireSettings>);
    /// The worker edited the per-step options array.
    async fn on_protocol_update(&self, edited: Vec<StepOptions>);
}

pub async fn ingest_message(topic: &str, payload: &[u8], handler: &dyn InboundHandler) {
    match topic {
        TOPIC_SETTINGS_REPLY => match serde_json::from_slice::<Option<WireSettings>>(payload) {
            Ok(settings) => handler.on_settings_reply(settings).await,
            Err(err) => warn!(topic, error = %err, "failed to parse settings reply"),
        },
        TOPIC_UPDATE_PROTOCOL => match serde_json::from_slice::<Vec<StepOptions>>(payload) {
            Ok(edited) => handler.on_protocol_update(edited).await,
            Err(err) => warn!(topic, error = %err, "failed to parse protocol update"),
        },
        _ => {
            warn!(topic, "ignoring unknown bus topic");
        }
    }
}

/// Owns the plugin's bus session: the inbound subscriptions and the
/// outbound publisher.
pub struct Bridge {
    bus: Arc<dyn Bus>,
    publisher: UiPublisher,
    session: Mutex<Option<Session>>,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inbound {
    settings: Subscription,
    protocol: Subscription,
}

impl Bridge {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            publisher: UiPublisher::new(Arc::clone(&bus)),
            bus,
            session: Mutex::new(None),
        }
    }

    pub fn publisher(&self) -> &UiPublisher {
        &self.publisher
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Subscribes to the inbound topics and dispatches messages to `handler`
    /// one at a time, in arrival order. Replaces any previous session.
    pub fn connect(&self, handler: Arc<dyn InboundHandler>) {
        self.disconnect();
        let subscriptions = Inbound {
            settings: self.bus.subscribe(TOPIC_SETTINGS_REPLY),
            protocol: self.bus.subscribe(TOPIC_UPDATE_PROTOCOL),
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ingest(
            Arc::clone(&self.bus),
            subscriptions,
            handler,
            cancel.clone(),
        ));
        *self.session.lock() = Some(Session { cancel, task });
        info!(topics = ?INBOUND_TOPICS, "bus bridge connected");
    }

    pub fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
            debug!("bus bridge disconnected");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn next_message(
    sub: &mut Subscription,
    topic: &str,
    bus: &Arc<dyn Bus>,
) -> BusMessage {
    loop {
        match sub.recv().await {
            Ok(msg) => return msg,
            Err(BusError::Lagged(skipped)) => {
                warn!(topic, skipped, "bus bridge lagged; messages dropped");
            }
            Err(err) => {
                warn!(topic, error = %err, "bus subscription lost; resubscribing");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                *sub = bus.subscribe(topic);
            }
        }
    }
}

async fn run_ingest(
    bus: Arc<dyn Bus>,
    inbound: Inbound,
    handler: Arc<dyn InboundHandler>,
    cancel: CancellationToken,
) {
    let Inbound {
        mut settings,
        mut protocol,
    } = inbound;
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = next_message(&mut settings, TOPIC_SETTINGS_REPLY, &bus) => msg,
            msg = next_message(&mut protocol, TOPIC_UPDATE_PROTOCOL, &bus) => msg,
        };
        ingest_message(&msg.topic, &msg.payload, handler.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;
    use transport_bus::LocalBus;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Settings(Option<WireSettings>),
        Protocol(Vec<StepOptions>),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_settings_reply(&self, settings: Option<WireSettings>) {
            let _ = self.0.send(Seen::Settings(settings));
        }

        async fn on_protocol_update(&self, edited: Vec<StepOptions>) {
            let _ = self.0.send(Seen::Protocol(edited));
        }
    }

    #[tokio::test]
    async fn dispatches_settings_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload = serde_json::to_vec(&json!({"x": 3, "video_config": ""})).unwrap();
        ingest_message(TOPIC_SETTINGS_REPLY, &payload, &Recorder(tx)).await;
        assert_eq!(
            rx.recv().await,
            Some(Seen::Settings(Some(WireSettings {
                x: Some(3),
                video_config: Some(String::new()),
                ..WireSettings::default()
            })))
        );
    }

    #[tokio::test]
    async fn null_settings_reply_is_none() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingest_message(TOPIC_SETTINGS_REPLY, b"null", &Recorder(tx)).await;
        assert_eq!(rx.recv().await, Some(Seen::Settings(None)));
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingest_message(TOPIC_UPDATE_PROTOCOL, b"{\"not\":\"an array\"}", &Recorder(tx)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bridge_listens_on_inbound_topics() {
        let bus = Arc::new(LocalBus::new());
        let bridge = Bridge::new(bus.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.connect(Arc::new(Recorder(tx)));

        let payload = serde_json::to_vec(&json!([{"video_enabled": false}])).unwrap();
        bus.publish(TOPIC_UPDATE_PROTOCOL, Bytes::from(payload), false)
            .unwrap();
        bus.publish(TOPIC_SETTINGS_REPLY, Bytes::from_static(b"null"), false)
            .unwrap();

        let mut seen = vec![
            rx.recv().await.expect("first message"),
            rx.recv().await.expect("second message"),
        ];
        seen.sort_by_key(|s| matches!(s, Seen::Settings(_)));
        let Seen::Protocol(edited) = &seen[0] else {
            panic!("expected protocol update, got {:?}", seen[0]);
        };
        assert_eq!(edited[0]["video_enabled"], false);
        assert_eq!(seen[1], Seen::Settings(None));
        assert!(bridge.is_connected());

        bridge.disconnect();
        assert!(!bridge.is_connected());
    }

    /// Hands out one already-closed settings subscription, then behaves.
    struct FlakyBus {
        inner: LocalBus,
        closed_once: std::sync::atomic::AtomicBool,
    }

    impl Bus for FlakyBus {
        fn subscribe(&self, topic: &str) -> Subscription {
            use std::sync::atomic::Ordering;
            if topic == TOPIC_SETTINGS_REPLY && !self.closed_once.swap(true, Ordering::SeqCst) {
                let (tx, rx) = tokio::sync::broadcast::channel(1);
                drop(tx);
                return Subscription::new(None, rx);
            }
            self.inner.subscribe(topic)
        }

        fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> transport_bus::BusResult<()> {
            self.inner.publish(topic, payload, retain)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_subscription_is_replaced() {
        let bus = Arc::new(FlakyBus {
            inner: LocalBus::new(),
            closed_once: std::sync::atomic::AtomicBool::new(false),
        });
        let bridge = Bridge::new(bus.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.connect(Arc::new(Recorder(tx)));

        let payload = serde_json::to_vec(&json!({"width": 410})).unwrap();
        bus.publish(TOPIC_SETTINGS_REPLY, Bytes::from(payload), true)
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("replayed after resubscribe");
        assert_eq!(
            seen,
            Some(Seen::Settings(Some(WireSettings {
                width: Some(410),
                ..WireSettings::default()
            })))
        );
        assert!(bridge.is_connected());
        bridge.disconnect();
    }
}
