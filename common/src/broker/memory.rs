//! In-process loopback broker.
//!
//! Each topic is an unbounded queue. Every consumer of a topic shares the
//! same backlog, which gives the delivery semantics of a single shared
//! subscription. Used for local runs (`memory://`) and tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    Broker, BrokerError, MessageConsumer, MessageProducer, OutboundMessage, ReceivedMessage,
};

const SYSTEM: &str = "memory";

struct TopicQueue {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
}

struct Inner {
    url: String,
    topics: Mutex<HashMap<String, Arc<TopicQueue>>>,
    next_entry: AtomicU64,
    acknowledged: AtomicU64,
    closed: AtomicBool,
}

/// Loopback broker shared by every producer and consumer created from it.
#[derive(Clone)]
pub struct MemoryBroker {
    // ---
    inner: Arc<Inner>,
}

impl MemoryBroker {
    // ---
    pub fn new(url: impl Into<String>) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                topics: Mutex::new(HashMap::new()),
                next_entry: AtomicU64::new(0),
                acknowledged: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of messages acknowledged so far, across all consumers.
    pub fn acknowledged_count(&self) -> u64 {
        // ---
        self.inner.acknowledged.load(Ordering::Acquire)
    }

    fn queue(&self, topic: &str) -> Arc<TopicQueue> {
        // ---
        let mut topics = lock(&self.inner.topics);
        let queue = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(TopicQueue {
                tx,
                rx: tokio::sync::Mutex::new(rx),
            })
        });
        Arc::clone(queue)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        // ---
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed(format!("broker {}", self.inner.url)));
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        // ---
        Self::new("memory://local")
    }
}

/// Locks a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // ---
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for MemoryBroker {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn url(&self) -> &str {
        // ---
        &self.inner.url
    }

    async fn create_producer(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn MessageProducer>, BrokerError> {
        // ---
        self.ensure_open()?;
        debug!(topic, producer = name, "Created memory producer");
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
            queue: self.queue(topic),
            topic: topic.to_string(),
            closed: false,
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        // ---
        self.ensure_open()?;
        debug!(topic, subscription, "Created memory consumer");
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            queue: self.queue(topic),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            pending: HashSet::new(),
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // ---
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    queue: Arc<TopicQueue>,
    topic: String,
    closed: bool,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<String, BrokerError> {
        // ---
        if self.closed {
            return Err(BrokerError::Closed(format!("producer on {}", self.topic)));
        }
        self.broker.ensure_open()?;

        let entry = self.broker.inner.next_entry.fetch_add(1, Ordering::Relaxed);
        let id = format!("0:{entry}:-1");
        let delivery = ReceivedMessage {
            id: id.clone(),
            payload: message.payload,
            properties: message.properties,
        };

        self.queue.tx.send(delivery).map_err(|e| BrokerError::Send {
            topic: self.topic.clone(),
            source: e.to_string().into(),
        })?;
        Ok(id)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        // ---
        self.closed = true;
        Ok(())
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    queue: Arc<TopicQueue>,
    topic: String,
    subscription: String,
    pending: HashSet<String>,
    closed: bool,
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscription(&self) -> &str {
        &self.subscription
    }

    async fn receive(&mut self) -> Result<ReceivedMessage, BrokerError> {
        // ---
        if self.closed {
            return Err(BrokerError::Closed(format!(
                "consumer {} on {}",
                self.subscription, self.topic
            )));
        }
        self.broker.ensure_open()?;

        let mut rx = self.queue.rx.lock().await;
        match rx.recv().await {
            Some(message) => {
                self.pending.insert(message.id.clone());
                Ok(message)
            }
            None => Err(BrokerError::Closed(format!("topic {}", self.topic))),
        }
    }

    async fn ack(&mut self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        // ---
        if !self.pending.remove(&message.id) {
            return Err(BrokerError::Ack {
                message_id: message.id.clone(),
                source: "message is not pending on this consumer".into(),
            });
        }
        self.broker.inner.acknowledged.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        // ---
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::broker::Properties;

    fn outbound(text: &str) -> OutboundMessage {
        // ---
        let mut properties = Properties::new();
        properties.insert("message_id".into(), text.into());
        OutboundMessage {
            payload: text.as_bytes().to_vec(),
            properties,
        }
    }

    #[tokio::test]
    async fn test_send_then_receive_preserves_properties() {
        // ---
        let broker = MemoryBroker::default();
        let mut producer = broker.create_producer("t", "p").await.expect("producer");
        let mut consumer = broker.subscribe("t", "s").await.expect("consumer");

        let id = producer.send(outbound("msg-1")).await.expect("send");
        let received = consumer.receive().await.expect("receive");

        assert_eq!(received.id, id);
        assert_eq!(received.payload, b"msg-1");
        assert_eq!(
            received.properties.get("message_id").map(String::as_str),
            Some("msg-1")
        );
    }

    #[tokio::test]
    async fn test_ack_requires_pending_message() {
        // ---
        let broker = MemoryBroker::default();
        let mut producer = broker.create_producer("t", "p").await.expect("producer");
        let mut consumer = broker.subscribe("t", "s").await.expect("consumer");

        producer.send(outbound("msg-1")).await.expect("send");
        let received = consumer.receive().await.expect("receive");

        consumer.ack(&received).await.expect("first ack");
        assert!(consumer.ack(&received).await.is_err());
        assert_eq!(broker.acknowledged_count(), 1);
    }

    #[tokio::test]
    async fn test_long_run_keeps_only_an_ack_count() {
        // ---
        let broker = MemoryBroker::default();
        let mut producer = broker.create_producer("t", "p").await.expect("producer");
        let mut consumer = broker.subscribe("t", "s").await.expect("consumer");

        for n in 0..1_000 {
            producer
                .send(outbound(&format!("msg-{n}")))
                .await
                .expect("send");
            let received = consumer.receive().await.expect("receive");
            consumer.ack(&received).await.expect("ack");
        }

        assert_eq!(broker.acknowledged_count(), 1_000);
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_send() {
        // ---
        let broker = MemoryBroker::default();
        let mut producer = broker.create_producer("t", "p").await.expect("producer");

        producer.close().await.expect("close");
        let err = producer.send(outbound("msg-1")).await.err().expect("closed");
        assert!(matches!(err, BrokerError::Closed(_)));
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_new_clients() {
        // ---
        let broker = MemoryBroker::default();
        broker.close().await.expect("close");

        assert!(broker.create_producer("t", "p").await.is_err());
        assert!(broker.subscribe("t", "s").await.is_err());
    }
}
