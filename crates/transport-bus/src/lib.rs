use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscriber lagged; {0} messages skipped")]
    Lagged(u64),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Topic subscription that yields the topic's retained message (if any)
/// before live traffic.
#[derive(Debug)]
pub struct Subscription {
    retained: Option<BusMessage>,
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(retained: Option<BusMessage>, rx: broadcast::Receiver<BusMessage>) -> Self {
        Self { retained, rx }
    }

    pub async fn recv(&mut self) -> BusResult<BusMessage> {
        if let Some(msg) = self.retained.take() {
            return Ok(msg);
        }
        self.rx.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Closed => BusError::Closed,
            broadcast::error::RecvError::Lagged(skipped) => BusError::Lagged(skipped),
        })
    }

    /// Non-blocking receive. `Ok(None)` means nothing is queued right now.
    pub fn try_recv(&mut self) -> BusResult<Option<BusMessage>> {
        if let Some(msg) = self.retained.take() {
            return Ok(Some(msg));
        }
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::TryRecvError::Closed) => Err(BusError::Closed),
        }
    }
}

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Publishes `payload` on `topic`. With `retain` set the bus keeps the
    /// message and replays it to every later subscriber of the topic; an
    /// empty retained payload clears the slot.
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()>;
}

#[derive(Debug, Default)]
struct Topics {
    senders: HashMap<String, broadcast::Sender<BusMessage>>,
    retained: HashMap<String, BusMessage>,
}

/// Simple in-memory bus for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<Topics>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retained(&self, topic: &str) -> Option<BusMessage> {
        self.topics.read().retained.get(topic).cloned()
    }
}

fn sender_for(topics: &mut Topics, topic: &str) -> broadcast::Sender<BusMessage> {
    topics
        .senders
        .entry(topic.to_string())
        .or_insert_with(|| broadcast::channel(64).0)
        .clone()
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        let mut guard = self.topics.write();
        let rx = sender_for(&mut guard, topic).subscribe();
        Subscription::new(guard.retained.get(topic).cloned(), rx)
    }

    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()> {
        let msg = BusMessage {
            topic: topic.to_string(),
            payload,
            retained: retain,
        };
        let sender = {
            let mut guard = self.topics.write();
            if retain {
                if msg.payload.is_empty() {
                    guard.retained.remove(topic);
                } else {
                    guard.retained.insert(topic.to_string(), msg.clone());
                }
            }
            sender_for(&mut guard, topic)
        };
        // No live subscribers is not an error for a pub/sub bus.
        let _ = sender.send(msg);
        Ok(())
    }
}
