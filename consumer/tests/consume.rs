use async_trait::async_trait;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use pulsar_otel_common::broker::MemoryBroker;
use pulsar_otel_common::{
    Broker, BrokerError, Instrumentation, MessageConsumer, MetricsContext, OutboundMessage,
    Properties, ReceivedMessage,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use consumer::{consume_loop, consume_next, create_consumer, ConsumeOutcome, ConsumeSettings};

struct Harness {
    exporter: InMemorySpanExporter,
    provider: SdkTracerProvider,
    metric_exporter: InMemoryMetricExporter,
    meter_provider: SdkMeterProvider,
    instrumentation: Instrumentation,
}

impl Harness {
    fn new() -> Self {
        // ---
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, "consumer-test");

        let metric_exporter = InMemoryMetricExporter::default();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metric_exporter.clone()).build())
            .build();
        let meter = meter_provider.meter("consumer-test");
        let metrics = MetricsContext::new("pulsar", "consumer-test", &meter).expect("metrics");

        Self {
            exporter,
            provider,
            metric_exporter,
            meter_provider,
            instrumentation: Instrumentation::new(tracer, metrics),
        }
    }

    /// Flushes the meter provider and returns the unit, attributes and
    /// value (sum or sample count) of the exported instrument `name`.
    fn exported(&self, name: &str) -> (String, Vec<(Vec<KeyValue>, u64)>) {
        // ---
        self.meter_provider.force_flush().expect("flush metrics");
        let exports = self.metric_exporter.get_finished_metrics().expect("metrics");
        let latest = exports.last().expect("one export");

        let metric = latest
            .scope_metrics()
            .flat_map(|scope| scope.metrics())
            .find(|metric| metric.name() == name)
            .unwrap_or_else(|| panic!("{name} not exported"));

        let points = match metric.data() {
            AggregatedMetrics::U64(MetricData::Sum(sum)) => sum
                .data_points()
                .map(|p| (p.attributes().cloned().collect(), p.value()))
                .collect(),
            AggregatedMetrics::F64(MetricData::Histogram(histogram)) => histogram
                .data_points()
                .map(|p| (p.attributes().cloned().collect(), p.count()))
                .collect(),
            other => panic!("{name}: unexpected data {other:?}"),
        };
        (metric.unit().to_string(), points)
    }

    fn spans(&self) -> Vec<SpanData> {
        // ---
        self.provider.force_flush().expect("flush");
        self.exporter.get_finished_spans().expect("spans")
    }

    fn consumed(&self, topic: &str, subscription: &str) -> u64 {
        // ---
        self.instrumentation
            .metrics()
            .messages_consumed_total
            .with_label_values(&[topic, subscription])
            .get()
    }
}

fn quick() -> ConsumeSettings {
    // ---
    ConsumeSettings {
        processing_delay: Duration::ZERO,
        receive_retry: Duration::from_millis(1),
    }
}

fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    // ---
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

fn message(id: &str, properties: &[(&str, &str)]) -> ReceivedMessage {
    // ---
    ReceivedMessage {
        id: id.to_string(),
        payload: b"hello".to_vec(),
        properties: properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Replays scripted receive results, then waits forever.
struct ScriptedConsumer {
    deliveries: VecDeque<Result<ReceivedMessage, BrokerError>>,
    fail_acks: bool,
    receives: u64,
}

impl ScriptedConsumer {
    fn new(deliveries: Vec<Result<ReceivedMessage, BrokerError>>) -> Self {
        Self {
            deliveries: deliveries.into(),
            fail_acks: false,
            receives: 0,
        }
    }
}

#[async_trait]
impl MessageConsumer for ScriptedConsumer {
    fn system(&self) -> &'static str {
        "test"
    }

    fn topic(&self) -> &str {
        "t"
    }

    fn subscription(&self) -> &str {
        "s"
    }

    async fn receive(&mut self) -> Result<ReceivedMessage, BrokerError> {
        self.receives += 1;
        match self.deliveries.pop_front() {
            Some(delivery) => delivery,
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        if self.fail_acks {
            return Err(BrokerError::Ack {
                message_id: message.id.clone(),
                source: "connection reset".into(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_process_span_continues_producer_trace() {
    // ---
    let harness = Harness::new();
    let broker = MemoryBroker::default();
    let mut producer = broker.create_producer("t", "p").await.expect("producer");
    let mut consumer = broker.subscribe("t", "s").await.expect("consumer");

    // Stand-in for the producer side: a span whose context rides in the properties.
    let tracer = harness.instrumentation.tracer();
    let publish = tracer.start("t publish");
    let publish_cx = Context::new().with_span(publish);
    let mut properties = Properties::new();
    properties.insert("message_id".into(), "msg-1".into());
    harness.instrumentation.inject(&publish_cx, &mut properties);
    let publish_span = publish_cx.span().span_context().clone();
    publish_cx.span().end();

    producer
        .send(OutboundMessage {
            payload: b"Hello".to_vec(),
            properties,
        })
        .await
        .expect("send");

    let shutdown = CancellationToken::new();
    let outcome = consume_next(
        consumer.as_mut(),
        &harness.instrumentation,
        &quick(),
        &shutdown,
    )
    .await;
    assert_eq!(
        outcome,
        ConsumeOutcome::Processed {
            message_id: "msg-1".into()
        }
    );

    let spans = harness.spans();
    let process = spans
        .iter()
        .find(|s| s.name == "t process")
        .expect("process span");
    assert_eq!(process.span_kind, SpanKind::Consumer);
    assert_eq!(
        process.span_context.trace_id(),
        publish_span.trace_id()
    );
    assert_eq!(process.parent_span_id, publish_span.span_id());
    assert_eq!(process.status, Status::Ok);
    assert!(process
        .events
        .events
        .iter()
        .any(|e| e.name == "message acknowledged"));

    assert_eq!(harness.consumed("t", "s"), 1);
    assert_eq!(broker.acknowledged_count(), 1);
}

#[tokio::test]
async fn test_missing_headers_start_a_new_trace() {
    // ---
    let harness = Harness::new();
    let mut consumer = ScriptedConsumer::new(vec![Ok(message("0:1:-1", &[]))]);

    let outcome = consume_next(
        &mut consumer,
        &harness.instrumentation,
        &quick(),
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(
        outcome,
        ConsumeOutcome::Processed {
            message_id: "unknown".into()
        }
    );

    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
    assert_eq!(
        attribute(&spans[0], "messaging.message.id"),
        Some(&Value::from("unknown"))
    );
    assert_eq!(
        attribute(&spans[0], "pulsar.message_id"),
        Some(&Value::from("0:1:-1"))
    );
}

#[tokio::test]
async fn test_malformed_traceparent_is_not_an_error() {
    // ---
    let harness = Harness::new();
    let mut consumer = ScriptedConsumer::new(vec![Ok(message(
        "0:2:-1",
        &[("message_id", "msg-2"), ("traceparent", "not-a-trace")],
    ))]);

    let outcome = consume_next(
        &mut consumer,
        &harness.instrumentation,
        &quick(),
        &CancellationToken::new(),
    )
    .await;
    assert!(matches!(outcome, ConsumeOutcome::Processed { .. }));
    assert_eq!(harness.spans()[0].parent_span_id, SpanId::INVALID);
}

#[tokio::test]
async fn test_receive_error_is_survived() {
    // ---
    let harness = Harness::new();
    let mut consumer = ScriptedConsumer::new(vec![
        Err(BrokerError::Receive {
            topic: "t".into(),
            source: "timeout".into(),
        }),
        Ok(message("0:3:-1", &[("message_id", "msg-3")])),
    ]);
    let shutdown = CancellationToken::new();

    let first = consume_next(&mut consumer, &harness.instrumentation, &quick(), &shutdown).await;
    let second = consume_next(&mut consumer, &harness.instrumentation, &quick(), &shutdown).await;

    assert_eq!(first, ConsumeOutcome::ReceiveFailed);
    assert_eq!(
        second,
        ConsumeOutcome::Processed {
            message_id: "msg-3".into()
        }
    );
    assert_eq!(harness.consumed("t", "s"), 1);
    assert_eq!(harness.spans().len(), 1);
}

#[tokio::test]
async fn test_failed_ack_records_no_consume_metric() {
    // ---
    let harness = Harness::new();
    let mut consumer = ScriptedConsumer::new(vec![Ok(message("0:4:-1", &[("message_id", "msg-4")]))]);
    consumer.fail_acks = true;

    let outcome = consume_next(
        &mut consumer,
        &harness.instrumentation,
        &quick(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(
        outcome,
        ConsumeOutcome::AckFailed {
            message_id: "msg-4".into()
        }
    );
    assert_eq!(harness.consumed("t", "s"), 0);
    let spans = harness.spans();
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn test_consume_observations_are_exported_with_stable_names() {
    // ---
    let harness = Harness::new();
    let mut consumer = ScriptedConsumer::new(vec![
        Ok(message("0:1:-1", &[("message_id", "msg-1")])),
        Ok(message("0:2:-1", &[("message_id", "msg-2")])),
    ]);
    let shutdown = CancellationToken::new();

    for _ in 0..2 {
        let outcome =
            consume_next(&mut consumer, &harness.instrumentation, &quick(), &shutdown).await;
        assert!(matches!(outcome, ConsumeOutcome::Processed { .. }));
    }

    let expected = vec![KeyValue::new("topic", "t"), KeyValue::new("subscription", "s")];

    let (unit, consumed) = harness.exported("pulsar.messages.consumed");
    assert_eq!(unit, "{messages}");
    assert_eq!(consumed.len(), 1);
    for kv in &expected {
        assert!(consumed[0].0.contains(kv), "missing {kv:?}");
    }
    assert_eq!(consumed[0].1, 2);

    let (unit, latency) = harness.exported("pulsar.message.consume.latency");
    assert_eq!(unit, "ms");
    assert_eq!(latency.len(), 1);
    assert_eq!(latency[0].1, 2);
}

#[tokio::test]
async fn test_cancellation_wins_over_receive() {
    // ---
    let harness = Harness::new();
    let mut consumer = ScriptedConsumer::new(vec![Ok(message("0:5:-1", &[]))]);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let acknowledged = consume_loop(&mut consumer, &harness.instrumentation, quick(), &shutdown).await;

    assert_eq!(acknowledged, 0);
    assert_eq!(consumer.receives, 0);
    assert!(harness.spans().is_empty());
}

#[tokio::test]
async fn test_consume_loop_counts_acknowledged_messages() {
    // ---
    let harness = Harness::new();
    let broker = MemoryBroker::default();
    let mut producer = broker.create_producer("t", "p").await.expect("producer");
    let consumer = create_consumer(&broker, &harness.instrumentation, "t", "s")
        .await
        .expect("consumer");

    for n in 1..=3 {
        let mut properties = Properties::new();
        properties.insert("message_id".into(), format!("msg-{n}"));
        producer
            .send(OutboundMessage {
                payload: vec![],
                properties,
            })
            .await
            .expect("send");
    }

    let shutdown = CancellationToken::new();
    let task = {
        let instrumentation = harness.instrumentation.clone();
        let shutdown = shutdown.clone();
        let mut consumer = consumer;
        tokio::spawn(async move {
            consume_loop(consumer.as_mut(), &instrumentation, quick(), &shutdown).await
        })
    };

    for _ in 0..200 {
        if broker.acknowledged_count() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();

    assert_eq!(task.await.expect("join"), 3);
    assert_eq!(harness.consumed("t", "s"), 3);

    let spans = harness.spans();
    assert_eq!(
        spans.iter().filter(|s| s.name == "t create_consumer").count(),
        1
    );
    assert_eq!(spans.iter().filter(|s| s.name == "t process").count(), 3);
}
