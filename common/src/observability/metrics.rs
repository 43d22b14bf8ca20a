//! Message and host metrics.
//!
//! One `MetricsContext` is intended per process. Every observation goes to
//! the OpenTelemetry instruments (exported by the meter pipeline) and is
//! mirrored into a local Prometheus registry that can be scraped on
//! `GET /metrics`.

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Latency buckets in milliseconds.
const LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9464`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// OpenTelemetry instrument handles, created once and shared.
#[derive(Clone)]
struct OtelInstruments {
    // ---
    messages_published: Counter<u64>,
    messages_consumed: Counter<u64>,
    publish_latency: Histogram<f64>,
    consume_latency: Histogram<f64>,
    connections_active: UpDownCounter<i64>,
    cpu_usage: Gauge<f64>,
    memory_usage: Gauge<f64>,
    memory_total: Gauge<f64>,
}

impl OtelInstruments {
    // ---
    fn new(meter: &Meter, namespace: &str) -> Self {
        // ---
        Self {
            messages_published: meter
                .u64_counter(format!("{namespace}.messages.published"))
                .with_description("Total number of messages published")
                .with_unit("{messages}")
                .build(),
            messages_consumed: meter
                .u64_counter(format!("{namespace}.messages.consumed"))
                .with_description("Total number of messages consumed")
                .with_unit("{messages}")
                .build(),
            publish_latency: meter
                .f64_histogram(format!("{namespace}.message.publish.latency"))
                .with_description("Latency of publishing messages")
                .with_unit("ms")
                .build(),
            consume_latency: meter
                .f64_histogram(format!("{namespace}.message.consume.latency"))
                .with_description("Latency of consuming messages")
                .with_unit("ms")
                .build(),
            connections_active: meter
                .i64_up_down_counter(format!("{namespace}.connections.active"))
                .with_description("Number of active connections to the broker")
                .with_unit("{connections}")
                .build(),
            cpu_usage: meter
                .f64_gauge("system.cpu.usage")
                .with_description("CPU usage ratio")
                .with_unit("1")
                .build(),
            memory_usage: meter
                .f64_gauge("system.memory.usage")
                .with_description("Memory usage in bytes")
                .with_unit("By")
                .build(),
            memory_total: meter
                .f64_gauge("system.memory.total")
                .with_description("Total system memory in bytes")
                .with_unit("By")
                .build(),
        }
    }
}

/// Metrics recorder: OpenTelemetry instruments plus a Prometheus mirror.
///
/// Record calls take the per-observation attributes as plain arguments and
/// never fail the caller. Handles are internally synchronized, so the
/// context is cloned into each task instead of being locked.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    namespace: String,
    registry: Registry,
    otel: OtelInstruments,

    // Message counters, labelled per observation
    pub messages_published_total: IntCounterVec,
    pub messages_consumed_total: IntCounterVec,

    // Latency histograms (milliseconds)
    pub publish_latency_ms: HistogramVec,
    pub consume_latency_ms: HistogramVec,

    // Connection and host gauges
    pub connections_active: IntGaugeVec,
    pub system_cpu_usage: GaugeVec,
    pub system_memory_usage: GaugeVec,
    pub system_memory_total: GaugeVec,
}

impl MetricsContext {
    // ---
    /// Create the instruments and register their Prometheus mirrors.
    ///
    /// `namespace` prefixes the message metrics (`<namespace>.messages.published`, ...);
    /// `process_name` is applied as a constant label (`process=<name>`) on the mirror.
    ///
    /// # Errors
    ///
    /// Returns error if a metric name is invalid or registered twice. The
    /// process cannot run without its instruments, so callers treat this as fatal.
    pub fn new(namespace: &str, process_name: &str, meter: &Meter) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            None,
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let messages_published_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_messages_published_total"),
                "Total number of messages published",
            ),
            &["topic", "success"],
        )?;
        let messages_consumed_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_messages_consumed_total"),
                "Total number of messages consumed",
            ),
            &["topic", "subscription"],
        )?;

        let publish_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                format!("{namespace}_message_publish_latency"),
                "Latency of publishing messages (ms)",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["topic", "success"],
        )?;
        let consume_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                format!("{namespace}_message_consume_latency"),
                "Latency of consuming messages (ms)",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["topic", "subscription"],
        )?;

        let connections_active = IntGaugeVec::new(
            Opts::new(
                format!("{namespace}_connections_active"),
                "Number of active connections to the broker",
            ),
            &["host"],
        )?;
        let system_cpu_usage = GaugeVec::new(
            Opts::new("system_cpu_usage", "CPU usage ratio"),
            &["host_name"],
        )?;
        let system_memory_usage = GaugeVec::new(
            Opts::new("system_memory_usage", "Memory usage in bytes"),
            &["host_name"],
        )?;
        let system_memory_total = GaugeVec::new(
            Opts::new("system_memory_total", "Total system memory in bytes"),
            &["host_name"],
        )?;

        // Register all metrics
        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(messages_consumed_total.clone()))?;
        registry.register(Box::new(publish_latency_ms.clone()))?;
        registry.register(Box::new(consume_latency_ms.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(system_cpu_usage.clone()))?;
        registry.register(Box::new(system_memory_usage.clone()))?;
        registry.register(Box::new(system_memory_total.clone()))?;

        Ok(Self {
            namespace: namespace.to_string(),
            registry,
            otel: OtelInstruments::new(meter, namespace),
            messages_published_total,
            messages_consumed_total,
            publish_latency_ms,
            consume_latency_ms,
            connections_active,
            system_cpu_usage,
            system_memory_usage,
            system_memory_total,
        })
    }

    pub fn namespace(&self) -> &str {
        // ---
        &self.namespace
    }

    /// Records one publish attempt and its latency.
    pub fn record_publish(&self, topic: &str, success: bool, latency: Duration) {
        // ---
        let latency_ms = as_millis(latency);
        let attributes = [
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("success", success),
        ];
        self.otel.messages_published.add(1, &attributes);
        self.otel.publish_latency.record(latency_ms, &attributes);

        let labels = [topic, if success { "true" } else { "false" }];
        self.messages_published_total.with_label_values(&labels).inc();
        self.publish_latency_ms
            .with_label_values(&labels)
            .observe(latency_ms);
    }

    /// Records one acknowledged message and its processing latency.
    pub fn record_consume(&self, topic: &str, subscription: &str, latency: Duration) {
        // ---
        let latency_ms = as_millis(latency);
        let attributes = [
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("subscription", subscription.to_string()),
        ];
        self.otel.messages_consumed.add(1, &attributes);
        self.otel.consume_latency.record(latency_ms, &attributes);

        let labels = [topic, subscription];
        self.messages_consumed_total.with_label_values(&labels).inc();
        self.consume_latency_ms
            .with_label_values(&labels)
            .observe(latency_ms);
    }

    /// Applies a signed delta to the active connection count for `host`.
    pub fn record_connection_change(&self, host: &str, delta: i64) {
        // ---
        self.otel
            .connections_active
            .add(delta, &[KeyValue::new("host", host.to_string())]);
        self.connections_active.with_label_values(&[host]).add(delta);
    }

    /// Records the CPU usage ratio (0.0–1.0) for `host_name`.
    pub fn record_cpu_usage(&self, host_name: &str, ratio: f64) {
        // ---
        self.otel
            .cpu_usage
            .record(ratio, &[KeyValue::new("host.name", host_name.to_string())]);
        self.system_cpu_usage
            .with_label_values(&[host_name])
            .set(ratio);
    }

    /// Records used and total memory in bytes for `host_name`.
    pub fn record_memory(&self, host_name: &str, used_bytes: u64, total_bytes: u64) {
        // ---
        let attributes = [KeyValue::new("host.name", host_name.to_string())];
        self.otel.memory_usage.record(used_bytes as f64, &attributes);
        self.otel.memory_total.record(total_bytes as f64, &attributes);

        self.system_memory_usage
            .with_label_values(&[host_name])
            .set(used_bytes as f64);
        self.system_memory_total
            .with_label_values(&[host_name])
            .set(total_bytes as f64);
    }

    /// Gather metric families from the Prometheus mirror.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Binds `cfg.bind` and spawns a minimal HTTP server that serves
    /// `GET /metrics`.
    ///
    /// Optional: the OTel pipeline is the primary export path, callers decide
    /// whether to also expose a scrape endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound. Must be called from
    /// within a Tokio runtime.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> Result<JoinHandle<Result<()>>> {
        // ---
        let builder = Server::try_bind(&cfg.bind)
            .with_context(|| format!("failed to bind metrics endpoint on {}", cfg.bind))?;
        let registry = Arc::new(self.registry.clone());

        let make_svc = make_service_fn(move |_conn| {
            let registry = Arc::clone(&registry);
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let registry = Arc::clone(&registry);
                    async move { handle_metrics_request(req, registry).await }
                }))
            }
        });

        let server = builder.serve(make_svc);
        tracing::info!(bind = %server.local_addr(), "Serving Prometheus metrics on /metrics");
        Ok(tokio::spawn(async move {
            // ---
            server.await.map_err(|e| anyhow::anyhow!(e))
        }))
    }
}

/// Milliseconds as a float; `Duration` is never negative.
fn as_millis(latency: Duration) -> f64 {
    // ---
    latency.as_secs_f64() * 1000.0
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn test_context() -> MetricsContext {
        // ---
        let meter = opentelemetry::global::meter("metrics-test");
        MetricsContext::new("pulsar", "test", &meter).expect("MetricsContext should init")
    }

    #[test]
    fn test_publish_observations_split_by_success() {
        // ---
        let ctx = test_context();

        ctx.record_publish("t", true, Duration::from_millis(3));
        ctx.record_publish("t", false, Duration::from_millis(7));
        ctx.record_publish("t", true, Duration::ZERO);

        let ok = ctx.messages_published_total.with_label_values(&["t", "true"]);
        let failed = ctx.messages_published_total.with_label_values(&["t", "false"]);
        assert_eq!(ok.get(), 2);
        assert_eq!(failed.get(), 1);

        let latency = ctx.publish_latency_ms.with_label_values(&["t", "true"]);
        assert_eq!(latency.get_sample_count(), 2);
        assert!(latency.get_sample_sum() >= 0.0);
    }

    #[test]
    fn test_consume_observations_tagged_with_subscription() {
        // ---
        let ctx = test_context();

        ctx.record_consume("t", "sub-a", Duration::from_millis(12));
        ctx.record_consume("t", "sub-b", Duration::from_millis(1));

        assert_eq!(
            ctx.messages_consumed_total
                .with_label_values(&["t", "sub-a"])
                .get(),
            1
        );
        let latency = ctx.consume_latency_ms.with_label_values(&["t", "sub-a"]);
        assert!((latency.get_sample_sum() - 12.0).abs() < 0.001);
    }

    #[test]
    fn test_connection_delta_is_signed() {
        // ---
        let ctx = test_context();

        ctx.record_connection_change("pulsar://localhost:6650", 1);
        ctx.record_connection_change("pulsar://localhost:6650", -1);

        let gauge = ctx
            .connections_active
            .with_label_values(&["pulsar://localhost:6650"]);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_host_gauges_keep_latest_value() {
        // ---
        let ctx = test_context();

        ctx.record_cpu_usage("host-1", 0.25);
        ctx.record_cpu_usage("host-1", 0.5);
        ctx.record_memory("host-1", 1024, 4096);

        assert_eq!(ctx.system_cpu_usage.with_label_values(&["host-1"]).get(), 0.5);
        assert_eq!(
            ctx.system_memory_total.with_label_values(&["host-1"]).get(),
            4096.0
        );
    }

    #[test]
    fn test_namespace_prefixes_message_metrics() {
        // ---
        let meter = opentelemetry::global::meter("metrics-test");
        let ctx = MetricsContext::new("orders", "test", &meter).expect("init");
        ctx.record_publish("t", true, Duration::from_millis(1));

        let names: Vec<String> = ctx.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"orders_messages_published_total".to_string()));
    }

    #[test]
    fn test_invalid_namespace_is_rejected() {
        // ---
        let meter = opentelemetry::global::meter("metrics-test");
        assert!(MetricsContext::new("not valid", "test", &meter).is_err());
    }

    #[tokio::test]
    async fn test_metrics_server_fails_fast_on_taken_port() {
        // ---
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = taken.local_addr().expect("addr");

        let err = test_context()
            .spawn_metrics_server(MetricsServerConfig::new(addr))
            .err()
            .expect("bind must fail");
        assert!(format!("{err:#}").contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_metrics_server_serves_registry() {
        // ---
        let ctx = test_context();
        ctx.record_publish("t", true, Duration::from_millis(3));

        let free = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = free.local_addr().expect("addr");
        drop(free);

        let server = ctx
            .spawn_metrics_server(MetricsServerConfig::new(addr))
            .expect("spawn");
        let uri: hyper::Uri = format!("http://{addr}/metrics").parse().expect("uri");
        let response = hyper::Client::new().get(uri).await.expect("scrape");
        assert_eq!(response.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(response.into_body()).await.expect("body");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("pulsar_messages_published_total"));

        server.abort();
    }
}
