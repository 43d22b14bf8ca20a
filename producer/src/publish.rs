//! Traced publish path.
//!
//! Every send attempt gets one `<topic> publish` span and one publish
//! observation in the metrics recorder, whether it succeeds or not.

use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use pulsar_otel_common::observability::{
    BROKER_MESSAGE_ID, BROKER_PRODUCER, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID,
    MESSAGING_OPERATION_TYPE, MESSAGING_SYSTEM,
};
use pulsar_otel_common::{
    Broker, BrokerError, Instrumentation, MessageProducer, OutboundMessage, Properties,
    MESSAGE_ID_PROPERTY,
};
use std::time::Instant;
use tracing::{error, info};

/// Creates a producer on `topic` inside a `<topic> create_producer` span.
///
/// # Errors
///
/// Returns the broker error if the producer cannot be created; the span
/// records it before ending.
pub async fn create_producer(
    broker: &dyn Broker,
    instrumentation: &Instrumentation,
    topic: &str,
    name: &str,
) -> Result<Box<dyn MessageProducer>, BrokerError> {
    // ---
    let tracer = instrumentation.tracer();
    let span = tracer
        .span_builder(format!("{topic} create_producer"))
        .with_kind(SpanKind::Client)
        .with_attributes([
            KeyValue::new(MESSAGING_SYSTEM, broker.system()),
            KeyValue::new(MESSAGING_DESTINATION_NAME, topic.to_string()),
            KeyValue::new(BROKER_PRODUCER, name.to_string()),
        ])
        .start(tracer);
    let cx = Context::current_with_span(span);
    let span = cx.span();
    let span_context = span.span_context().clone();

    info!(
        topic,
        producer = name,
        trace_id = %span_context.trace_id(),
        span_id = %span_context.span_id(),
        "Creating producer"
    );

    let result = broker.create_producer(topic, name).await;
    match &result {
        Ok(_) => span.set_status(Status::Ok),
        Err(e) => {
            error!(topic, producer = name, "Failed to create producer: {e}");
            span.record_error(e);
            span.set_status(Status::error(e.to_string()));
        }
    }
    span.end();

    result
}

/// Publishes one message with its trace context in the properties.
///
/// `properties` is reused when given, otherwise a new mapping is created.
/// `message_id` is written to the `message_id` property.
///
/// # Arguments
///
/// * `producer` - Open producer for the destination topic
/// * `instrumentation` - Tracer, propagator and metrics for this process
/// * `message_id` - Application-assigned id, also set as a span attribute
/// * `payload` - Opaque message body
/// * `properties` - Extra properties to send alongside the trace context
///
/// # Errors
///
/// Returns the broker error if the send fails. The failure is still
/// recorded on the span and in the publish metrics.
pub async fn publish_traced(
    producer: &mut dyn MessageProducer,
    instrumentation: &Instrumentation,
    message_id: &str,
    payload: Vec<u8>,
    properties: Option<Properties>,
) -> Result<String, BrokerError> {
    // ---
    let topic = producer.topic().to_string();
    let started = Instant::now();

    let tracer = instrumentation.tracer();
    let span = tracer
        .span_builder(format!("{topic} publish"))
        .with_kind(SpanKind::Producer)
        .with_attributes([
            KeyValue::new(MESSAGING_SYSTEM, producer.system()),
            KeyValue::new(MESSAGING_OPERATION_TYPE, "publish"),
            KeyValue::new(MESSAGING_MESSAGE_ID, message_id.to_string()),
            KeyValue::new(MESSAGING_DESTINATION_NAME, topic.clone()),
        ])
        .start(tracer);
    let cx = Context::current_with_span(span);
    let span = cx.span();
    let span_context = span.span_context().clone();

    let mut properties = properties.unwrap_or_default();
    properties.insert(MESSAGE_ID_PROPERTY.to_string(), message_id.to_string());
    instrumentation.inject(&cx, &mut properties);

    info!(
        message_id,
        topic = %topic,
        trace_id = %span_context.trace_id(),
        span_id = %span_context.span_id(),
        "Producing message"
    );

    let result = producer
        .send(OutboundMessage {
            payload,
            properties,
        })
        .await;

    instrumentation
        .metrics()
        .record_publish(&topic, result.is_ok(), started.elapsed());

    match &result {
        Ok(broker_id) => {
            info!(
                message_id,
                broker_id = %broker_id,
                trace_id = %span_context.trace_id(),
                span_id = %span_context.span_id(),
                "Published message"
            );
            span.set_attribute(KeyValue::new(BROKER_MESSAGE_ID, broker_id.clone()));
            span.set_status(Status::Ok);
        }
        Err(e) => {
            error!(message_id, topic = %topic, "Failed to publish message: {e}");
            span.record_error(e);
            span.set_status(Status::error("failed to publish message"));
        }
    }
    span.end();

    result
}
