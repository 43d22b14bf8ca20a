//! Common building blocks shared by the producer, consumer and orchestrator.
//!
//! This crate provides the trace-context carrier, the metrics recorder, the
//! telemetry export pipelines, the broker seam and the host sampler used by
//! both sides of the traced message flow.

pub mod broker;
pub mod cli;
pub mod config;
pub mod instrumentation;
pub mod lifecycle;
pub mod observability;
pub mod propagation;
pub mod sampler;

pub use broker::{
    connect, Broker, BrokerError, MessageConsumer, MessageProducer, OutboundMessage, Properties,
    ReceivedMessage,
};
pub use cli::ColorWhen;
pub use config::{parse_headers, BrokerConfig, ExporterConfig, LoopConfig};
pub use instrumentation::Instrumentation;
pub use lifecycle::{StartGate, Teardown, TeardownFailure, TeardownReport};
pub use observability::{
    init_tracing, MetricsContext, MetricsServerConfig, TelemetryPipelines, SERVICE_NAME,
};
pub use propagation::{extract_context, inject_context, Carrier};
pub use sampler::{HostProbe, MemorySample, SysinfoProbe, SystemSampler};

/// Property key carrying the application-assigned message id.
pub const MESSAGE_ID_PROPERTY: &str = "message_id";
