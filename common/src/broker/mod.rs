//! Broker seam.
//!
//! The instrumentation only talks to the broker through these traits: send a
//! payload with properties, receive the next delivery, acknowledge it, close.
//! Connection management, durability and redelivery stay inside the
//! implementation.

mod memory;
mod pulsar_broker;

pub use self::memory::MemoryBroker;
pub use self::pulsar_broker::PulsarBroker;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::BrokerConfig;

/// Message properties. Physically carries the trace context.
pub type Properties = BTreeMap<String, String>;

/// Boxed source error from a broker client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the broker seam.
#[derive(Debug, Error)]
pub enum BrokerError {
    // ---
    #[error("failed to connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("unsupported broker url {0}")]
    UnsupportedUrl(String),

    #[error("failed to create producer on {topic}")]
    CreateProducer {
        topic: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to subscribe {subscription} to {topic}")]
    Subscribe {
        topic: String,
        subscription: String,
        #[source]
        source: BoxError,
    },

    #[error("send failed on {topic}")]
    Send {
        topic: String,
        #[source]
        source: BoxError,
    },

    #[error("receive failed on {topic}")]
    Receive {
        topic: String,
        #[source]
        source: BoxError,
    },

    #[error("acknowledge failed for message {message_id}")]
    Ack {
        message_id: String,
        #[source]
        source: BoxError,
    },

    #[error("{0} is closed")]
    Closed(String),

    #[error("failed to close {resource}")]
    Close {
        resource: String,
        #[source]
        source: BoxError,
    },
}

/// Outbound message: opaque payload plus properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    // ---
    pub payload: Vec<u8>,
    pub properties: Properties,
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    // ---
    /// Broker-assigned identifier.
    pub id: String,
    pub payload: Vec<u8>,
    pub properties: Properties,
}

/// Sending side of a topic.
#[async_trait]
pub trait MessageProducer: Send {
    // ---
    /// Value of the `messaging.system` span attribute.
    fn system(&self) -> &'static str;

    fn topic(&self) -> &str;

    /// Sends one message and returns the broker-assigned id.
    async fn send(&mut self, message: OutboundMessage) -> Result<String, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Receiving side of a subscription.
#[async_trait]
pub trait MessageConsumer: Send {
    // ---
    fn system(&self) -> &'static str;

    fn topic(&self) -> &str;

    fn subscription(&self) -> &str;

    /// Waits for the next delivery.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no message.
    async fn receive(&mut self) -> Result<ReceivedMessage, BrokerError>;

    async fn ack(&mut self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// A connected broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    // ---
    fn system(&self) -> &'static str;

    /// Service URL, used as the `host` attribute of connection metrics.
    fn url(&self) -> &str;

    async fn create_producer(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn MessageProducer>, BrokerError>;

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Connects to the broker named by `cfg.url`.
///
/// `pulsar://` and `pulsar+ssl://` go to a Pulsar cluster; `memory://`
/// creates an in-process loopback broker.
///
/// # Errors
///
/// Returns error if the scheme is unknown or the connection fails.
pub async fn connect(cfg: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    // ---
    match cfg.url.split_once("://").map(|(scheme, _)| scheme) {
        Some("memory") => Ok(Arc::new(MemoryBroker::new(cfg.url.clone()))),
        Some("pulsar") | Some("pulsar+ssl") => Ok(Arc::new(PulsarBroker::connect(cfg).await?)),
        _ => Err(BrokerError::UnsupportedUrl(cfg.url.clone())),
    }
}
