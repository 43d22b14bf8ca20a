//! OpenTelemetry export pipelines.
//!
//! Sets up:
//! - Trace provider (OTLP/gRPC when an endpoint is configured, stdout otherwise)
//! - Meter provider with a periodic reader on the same exporter choice
//! - A shared resource describing the service

use anyhow::{Context, Result};
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, Sampler, SdkTracer, SdkTracerProvider, SpanExporter,
};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION as SERVICE_VERSION_KEY;
use std::collections::HashMap;
use std::time::Duration;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tracing::{debug, info};

use crate::config::{parse_headers, ExporterConfig};

/// Service name reported on every span and metric.
pub const SERVICE_NAME: &str = "pulsar-otel-example";

/// Service version, taken from the workspace manifest.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Spans are flushed at least this often.
const SPAN_BATCH_DELAY: Duration = Duration::from_secs(5);

/// Small batches so spans show up quickly in the backend.
const SPAN_BATCH_SIZE: usize = 10;

/// Tracer and meter providers owned by the process.
///
/// Both providers are handles: cloning them shares the same pipeline.
/// Call [`TelemetryPipelines::shutdown_tracer`] and
/// [`TelemetryPipelines::shutdown_meter`] during teardown to flush.
#[derive(Clone)]
pub struct TelemetryPipelines {
    // ---
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryPipelines {
    // ---
    /// Builds both pipelines from `cfg`.
    ///
    /// # Errors
    ///
    /// Returns error if an OTLP exporter cannot be constructed. Startup
    /// treats this as fatal.
    pub fn install(cfg: &ExporterConfig) -> Result<Self> {
        // ---
        let resource = build_resource();
        let tracer_provider = build_tracer_provider(cfg, resource.clone())?;
        let meter_provider = build_meter_provider(cfg, resource)?;

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }

    /// Wraps providers built elsewhere, e.g. with in-memory exporters.
    pub fn from_providers(
        tracer_provider: SdkTracerProvider,
        meter_provider: SdkMeterProvider,
    ) -> Self {
        // ---
        Self {
            tracer_provider,
            meter_provider,
        }
    }

    pub fn tracer(&self) -> SdkTracer {
        // ---
        self.tracer_provider.tracer(SERVICE_NAME)
    }

    pub fn meter(&self) -> Meter {
        // ---
        self.meter_provider.meter(SERVICE_NAME)
    }

    /// Flushes and stops the trace pipeline.
    ///
    /// Provider shutdown blocks while the exporter drains, so it runs on the
    /// blocking pool.
    pub async fn shutdown_tracer(&self) -> Result<()> {
        // ---
        let provider = self.tracer_provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .context("tracer shutdown task failed")?
            .context("failed to shut down tracer provider")
    }

    /// Flushes and stops the metrics pipeline.
    pub async fn shutdown_meter(&self) -> Result<()> {
        // ---
        let provider = self.meter_provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .context("meter shutdown task failed")?
            .context("failed to shut down meter provider")
    }
}

fn build_resource() -> Resource {
    // ---
    // Resource::builder() also applies OTEL_RESOURCE_ATTRIBUTES / OTEL_SERVICE_NAME
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attributes([
            KeyValue::new(SERVICE_VERSION_KEY, SERVICE_VERSION),
            KeyValue::new("environment", "development"),
        ])
        .build()
}

fn build_tracer_provider(cfg: &ExporterConfig, resource: Resource) -> Result<SdkTracerProvider> {
    // ---
    let processor = match cfg.endpoint.as_deref() {
        Some(endpoint) => {
            let mut builder = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(normalize_endpoint(endpoint, cfg.insecure))
                .with_metadata(header_metadata(&parse_headers(
                    cfg.headers.as_deref().unwrap_or_default(),
                )));
            if !cfg.insecure {
                builder = builder.with_tls_config(
                    tonic::transport::ClientTlsConfig::new().with_native_roots(),
                );
            }
            let exporter = builder
                .build()
                .context("failed to create OTLP trace exporter")?;
            info!(endpoint, insecure = cfg.insecure, "Using OTLP trace exporter");
            batch_processor(exporter)
        }
        None => {
            info!("Using stdout trace exporter");
            batch_processor(opentelemetry_stdout::SpanExporter::default())
        }
    };

    Ok(SdkTracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(resource)
        .with_sampler(Sampler::AlwaysOn)
        .build())
}

fn batch_processor<E: SpanExporter + 'static>(exporter: E) -> BatchSpanProcessor {
    // ---
    let config = BatchConfigBuilder::default()
        .with_scheduled_delay(SPAN_BATCH_DELAY)
        .with_max_export_batch_size(SPAN_BATCH_SIZE)
        .build();
    BatchSpanProcessor::builder(exporter)
        .with_batch_config(config)
        .build()
}

fn build_meter_provider(cfg: &ExporterConfig, resource: Resource) -> Result<SdkMeterProvider> {
    // ---
    let interval = Duration::from_secs(cfg.export_interval_secs);
    let builder = match cfg.endpoint.as_deref() {
        Some(endpoint) => {
            let mut exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(normalize_endpoint(endpoint, cfg.insecure))
                .with_metadata(header_metadata(&parse_headers(
                    cfg.headers.as_deref().unwrap_or_default(),
                )));
            if !cfg.insecure {
                exporter = exporter.with_tls_config(
                    tonic::transport::ClientTlsConfig::new().with_native_roots(),
                );
            }
            let exporter = exporter
                .build()
                .context("failed to create OTLP metric exporter")?;
            info!(
                endpoint,
                push_interval = ?interval,
                "Using OTLP metrics exporter"
            );
            SdkMeterProvider::builder().with_reader(
                PeriodicReader::builder(exporter)
                    .with_interval(interval)
                    .build(),
            )
        }
        None => {
            info!(push_interval = ?interval, "Using stdout metrics exporter");
            SdkMeterProvider::builder().with_reader(
                PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
                    .with_interval(interval)
                    .build(),
            )
        }
    };

    Ok(builder.with_resource(resource).build())
}

/// Adds a scheme to a bare `host:port` endpoint.
///
/// tonic needs a full URI; the scheme follows the transport-security flag.
fn normalize_endpoint(endpoint: &str, insecure: bool) -> String {
    // ---
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

/// Converts exporter headers into gRPC metadata.
///
/// Headers that are not valid ASCII metadata are skipped.
fn header_metadata(headers: &HashMap<String, String>) -> MetadataMap {
    // ---
    let mut metadata = MetadataMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = match MetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                debug!(header = %key, "Skipping invalid exporter header name: {e}");
                continue;
            }
        };
        let val = match MetadataValue::try_from(value.as_str()) {
            Ok(val) => val,
            Err(e) => {
                debug!(header = %key, "Skipping invalid exporter header value: {e}");
                continue;
            }
        };
        metadata.insert(name, val);
    }
    metadata
}
