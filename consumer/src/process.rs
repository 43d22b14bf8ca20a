//! Traced receive/process/acknowledge path.

use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use pulsar_otel_common::observability::{
    BROKER_MESSAGE_ID, BROKER_SUBSCRIPTION, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID,
    MESSAGING_OPERATION_TYPE, MESSAGING_SYSTEM,
};
use pulsar_otel_common::{
    Broker, BrokerError, Instrumentation, MessageConsumer, ReceivedMessage, MESSAGE_ID_PROPERTY,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Message id used when a delivery carries no `message_id` property.
pub const UNKNOWN_MESSAGE_ID: &str = "unknown";

/// Pacing of the consume path.
#[derive(Debug, Clone, Copy)]
pub struct ConsumeSettings {
    // ---
    /// Simulated work per message, spent before the acknowledgment.
    pub processing_delay: Duration,

    /// Pause after a failed receive before the next attempt.
    pub receive_retry: Duration,
}

impl Default for ConsumeSettings {
    fn default() -> Self {
        // ---
        Self {
            processing_delay: Duration::from_millis(500),
            receive_retry: Duration::from_millis(100),
        }
    }
}

/// What one call to [`consume_next`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Shutdown fired before a message arrived.
    Cancelled,

    /// The receive call failed; nothing was processed.
    ReceiveFailed,

    /// The message was processed and acknowledged.
    Processed { message_id: String },

    /// The message was processed but the acknowledgment failed.
    AckFailed { message_id: String },
}

/// Subscribes to `topic` inside a `<topic> create_consumer` span.
///
/// # Errors
///
/// Returns the broker error if the subscription cannot be created.
pub async fn create_consumer(
    broker: &dyn Broker,
    instrumentation: &Instrumentation,
    topic: &str,
    subscription: &str,
) -> Result<Box<dyn MessageConsumer>, BrokerError> {
    // ---
    let tracer = instrumentation.tracer();
    let span = tracer
        .span_builder(format!("{topic} create_consumer"))
        .with_kind(SpanKind::Client)
        .with_attributes([
            KeyValue::new(MESSAGING_SYSTEM, broker.system()),
            KeyValue::new(MESSAGING_DESTINATION_NAME, topic.to_string()),
            KeyValue::new(BROKER_SUBSCRIPTION, subscription.to_string()),
        ])
        .start(tracer);
    let cx = Context::current_with_span(span);
    let span = cx.span();

    info!(
        topic,
        subscription,
        trace_id = %span.span_context().trace_id(),
        span_id = %span.span_context().span_id(),
        "Creating consumer"
    );

    let result = broker.subscribe(topic, subscription).await;
    match &result {
        Ok(_) => span.set_status(Status::Ok),
        Err(e) => {
            error!(topic, subscription, "Failed to create consumer: {e}");
            span.record_error(e);
            span.set_status(Status::error(e.to_string()));
        }
    }
    span.end();

    result
}

/// Waits for one delivery and processes it under a `<topic> process` span.
///
/// The span continues the trace found in the message properties, or
/// starts a new trace when there is none. The consume observation is only
/// recorded once the acknowledgment succeeded; its latency runs from the
/// moment the message was handed over to the end of the acknowledgment.
///
/// # Arguments
///
/// * `consumer` - Open consumer on the subscription
/// * `instrumentation` - Tracer, propagator and metrics for this process
/// * `settings` - Processing delay and receive retry pause
/// * `shutdown` - Takes priority over a pending receive
pub async fn consume_next(
    consumer: &mut dyn MessageConsumer,
    instrumentation: &Instrumentation,
    settings: &ConsumeSettings,
    shutdown: &CancellationToken,
) -> ConsumeOutcome {
    // ---
    let received = tokio::select! {
        biased;

        _ = shutdown.cancelled() => return ConsumeOutcome::Cancelled,
        received = consumer.receive() => received,
    };

    let message = match received {
        Ok(message) => message,
        Err(e) => {
            error!(
                topic = consumer.topic(),
                subscription = consumer.subscription(),
                "Error receiving message: {e}"
            );
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(settings.receive_retry) => {}
            }
            return ConsumeOutcome::ReceiveFailed;
        }
    };
    let started = Instant::now();

    process_and_ack(consumer, instrumentation, settings, message, started).await
}

async fn process_and_ack(
    consumer: &mut dyn MessageConsumer,
    instrumentation: &Instrumentation,
    settings: &ConsumeSettings,
    message: ReceivedMessage,
    started: Instant,
) -> ConsumeOutcome {
    // ---
    let topic = consumer.topic().to_string();
    let subscription = consumer.subscription().to_string();
    let message_id = message
        .properties
        .get(MESSAGE_ID_PROPERTY)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_MESSAGE_ID.to_string());

    let parent = instrumentation.extract(&message.properties);
    let tracer = instrumentation.tracer();
    let span = tracer
        .span_builder(format!("{topic} process"))
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new(MESSAGING_SYSTEM, consumer.system()),
            KeyValue::new(MESSAGING_OPERATION_TYPE, "process"),
            KeyValue::new(MESSAGING_MESSAGE_ID, message_id.clone()),
            KeyValue::new(MESSAGING_DESTINATION_NAME, topic.clone()),
            KeyValue::new(BROKER_SUBSCRIPTION, subscription.clone()),
            KeyValue::new(BROKER_MESSAGE_ID, message.id.clone()),
        ])
        .start_with_context(tracer, &parent);
    let cx = parent.with_span(span);
    let span = cx.span();
    let span_context = span.span_context().clone();

    let content = String::from_utf8_lossy(&message.payload);
    info!(
        message_id = %message_id,
        broker_id = %message.id,
        content = %content,
        topic = %topic,
        trace_id = %span_context.trace_id(),
        span_id = %span_context.span_id(),
        "Received message"
    );
    if !settings.processing_delay.is_zero() {
        tokio::time::sleep(settings.processing_delay).await;
    }

    let outcome = match consumer.ack(&message).await {
        Ok(()) => {
            instrumentation
                .metrics()
                .record_consume(&topic, &subscription, started.elapsed());
            span.add_event("message acknowledged", vec![]);
            span.set_status(Status::Ok);
            ConsumeOutcome::Processed { message_id }
        }
        Err(e) => {
            warn!(
                message_id = %message_id,
                topic = %topic,
                subscription = %subscription,
                "Failed to acknowledge message: {e}"
            );
            span.record_error(&e);
            span.set_status(Status::error("failed to acknowledge message"));
            ConsumeOutcome::AckFailed { message_id }
        }
    };
    span.end();

    outcome
}
