//! Apache Pulsar adapter for the broker seam.

use async_trait::async_trait;
use futures::TryStreamExt;
use pulsar::consumer::Message;
use pulsar::message::proto::MessageIdData;
use pulsar::{
    producer, Authentication, ConnectionRetryOptions, Consumer, DeserializeMessage,
    OperationRetryOptions, Producer, Pulsar, SerializeMessage, SubType, TokioExecutor,
};
use std::collections::HashMap;
use tracing::info;

use super::{
    Broker, BrokerError, MessageConsumer, MessageProducer, OutboundMessage, ReceivedMessage,
};
use crate::config::BrokerConfig;

const SYSTEM: &str = "pulsar";

/// Connected Pulsar client.
pub struct PulsarBroker {
    // ---
    client: Pulsar<TokioExecutor>,
    url: String,
}

impl PulsarBroker {
    // ---
    /// Connects with the token and timeouts from `cfg`.
    ///
    /// # Errors
    ///
    /// Returns error if the initial connection cannot be established.
    pub async fn connect(cfg: &BrokerConfig) -> Result<Self, BrokerError> {
        // ---
        let mut builder = Pulsar::builder(cfg.url.clone(), TokioExecutor)
            .with_operation_retry_options(OperationRetryOptions {
                operation_timeout: cfg.operation_timeout(),
                ..Default::default()
            })
            .with_connection_retry_options(ConnectionRetryOptions {
                connection_timeout: cfg.connection_timeout(),
                ..Default::default()
            });

        match cfg.token() {
            Some(token) => {
                builder = builder.with_auth(Authentication {
                    name: "token".to_string(),
                    data: token.as_bytes().to_vec(),
                });
                info!("Using token authentication");
            }
            None => info!("No authentication token provided, using anonymous access"),
        }

        let client = builder.build().await.map_err(|e| BrokerError::Connect {
            url: cfg.url.clone(),
            source: Box::new(e),
        })?;

        Ok(Self {
            client,
            url: cfg.url.clone(),
        })
    }
}

#[async_trait]
impl Broker for PulsarBroker {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn url(&self) -> &str {
        // ---
        &self.url
    }

    async fn create_producer(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn MessageProducer>, BrokerError> {
        // ---
        let inner = self
            .client
            .producer()
            .with_topic(topic)
            .with_name(name)
            .build()
            .await
            .map_err(|e| BrokerError::CreateProducer {
                topic: topic.to_string(),
                source: Box::new(e),
            })?;

        Ok(Box::new(PulsarProducer {
            inner,
            topic: topic.to_string(),
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        // ---
        let inner: Consumer<RawPayload, TokioExecutor> = self
            .client
            .consumer()
            .with_topic(topic)
            .with_subscription_type(SubType::Shared)
            .with_subscription(subscription)
            .build()
            .await
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
                source: Box::new(e),
            })?;

        Ok(Box::new(PulsarConsumer {
            inner,
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            pending: HashMap::new(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // ---
        // Connections are released when the last producer/consumer and the
        // client handle are dropped.
        Ok(())
    }
}

/// Payload plus properties, serialized as a raw Pulsar message.
struct Outbound(OutboundMessage);

impl SerializeMessage for Outbound {
    fn serialize_message(input: Self) -> Result<producer::Message, pulsar::Error> {
        // ---
        let OutboundMessage {
            payload,
            properties,
        } = input.0;
        Ok(producer::Message {
            payload,
            properties: properties.into_iter().collect(),
            ..Default::default()
        })
    }
}

/// Payload bytes, left undecoded.
struct RawPayload;

impl DeserializeMessage for RawPayload {
    type Output = Vec<u8>;

    fn deserialize_message(payload: &pulsar::Payload) -> Self::Output {
        // ---
        payload.data.clone()
    }
}

/// Formats a message id the way Pulsar tools print it.
fn format_message_id(id: &MessageIdData) -> String {
    // ---
    format!(
        "{}:{}:{}",
        id.ledger_id,
        id.entry_id,
        id.partition.unwrap_or(-1)
    )
}

struct PulsarProducer {
    inner: Producer<TokioExecutor>,
    topic: String,
}

#[async_trait]
impl MessageProducer for PulsarProducer {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<String, BrokerError> {
        // ---
        let topic = self.topic.clone();
        let send_error = |e: pulsar::Error| BrokerError::Send {
            topic: topic.clone(),
            source: Box::new(e),
        };

        let receipt = self
            .inner
            .send_non_blocking(Outbound(message))
            .await
            .map_err(send_error)?
            .await
            .map_err(send_error)?;

        Ok(receipt
            .message_id
            .as_ref()
            .map(format_message_id)
            .unwrap_or_else(|| format!("seq:{}", receipt.sequence_id)))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        // ---
        self.inner.close().await.map_err(|e| BrokerError::Close {
            resource: format!("producer on {}", self.topic),
            source: Box::new(e),
        })
    }
}

struct PulsarConsumer {
    inner: Consumer<RawPayload, TokioExecutor>,
    topic: String,
    subscription: String,
    /// Delivered but not yet acknowledged, keyed by formatted id.
    pending: HashMap<String, Message<RawPayload>>,
}

#[async_trait]
impl MessageConsumer for PulsarConsumer {
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
        let message = self
            .inner
            .try_next()
            .await
            .map_err(|e| BrokerError::Receive {
                topic: self.topic.clone(),
                source: Box::new(e),
            })?
            .ok_or_else(|| BrokerError::Closed(format!("consumer stream on {}", self.topic)))?;

        let id = format_message_id(message.message_id());
        let properties = message
            .metadata()
            .properties
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect();
        let received = ReceivedMessage {
            id: id.clone(),
            payload: message.deserialize(),
            properties,
        };

        self.pending.insert(id, message);
        Ok(received)
    }

    async fn ack(&mut self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        // ---
        let Some(delivered) = self.pending.remove(&message.id) else {
            return Err(BrokerError::Ack {
                message_id: message.id.clone(),
                source: "message is not pending on this consumer".into(),
            });
        };

        self.inner
            .ack(&delivered)
            .await
            .map_err(|e| BrokerError::Ack {
                message_id: message.id.clone(),
                source: Box::new(e),
            })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        // ---
        self.inner.close().await.map_err(|e| BrokerError::Close {
            resource: format!("consumer {} on {}", self.subscription, self.topic),
            source: Box::new(e),
        })
    }
}
