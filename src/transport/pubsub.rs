//! Topic-based publish/subscribe adapter.
//!
//! An in-process broker stands in for an external message broker: the
//! adapter publishes outbound packets to one topic and subscribes to
//! another. Subscribers that fall behind lose the oldest messages, which
//! matches the at-most-once semantics of the real-time feeds carried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::core::{TransportError, TransportResult};

use super::{Transport, TransportEvent, TransportKind};

/// Retained messages per topic before slow subscribers start lagging.
const TOPIC_DEPTH: usize = 256;

/// In-process topic broker shared between adapters.
#[derive(Clone, Default)]
pub struct PubSubBroker {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl PubSubBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> broadcast::Sender<Bytes> {
        let mut topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_DEPTH).0)
            .clone()
    }

    /// Publish a message to a topic. Messages without subscribers are
    /// dropped silently.
    pub fn publish(&self, topic: &str, payload: Bytes) {
        let _ = self.topic(topic).send(payload);
    }

    /// Subscribe to a topic, receiving messages published after this call.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        self.topic(topic).subscribe()
    }
}

/// Pub/sub transport bound to one publish topic and one subscribe topic.
pub struct PubSubTransport {
    broker: PubSubBroker,
    pub_topic: String,
    sub_topic: String,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl PubSubTransport {
    /// Create an adapter on `broker` that publishes to `pub_topic` and
    /// receives from `sub_topic`.
    pub fn new(broker: PubSubBroker, pub_topic: &str, sub_topic: &str) -> Self {
        Self {
            broker,
            pub_topic: pub_topic.to_owned(),
            sub_topic: sub_topic.to_owned(),
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        self.close().await;

        let mut rx = self.broker.subscribe(&self.sub_topic);
        self.connected.store(true, Ordering::Relaxed);

        let connected = Arc::clone(&self.connected);
        let name = self.name();
        let topic = self.sub_topic.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if events
                            .send(TransportEvent::Packet {
                                transport: name,
                                payload,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(topic = %topic, missed, "pubsub subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        connected.store(false, Ordering::Relaxed);
                        let _ = events.send(TransportEvent::Closed { transport: name }).await;
                        return;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.broker
            .publish(&self.pub_topic, Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}
