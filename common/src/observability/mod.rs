//! Observability utilities (logging, metrics and export pipelines).

mod attributes;
mod metrics;
mod pipeline;
mod tracing;

pub use attributes::*;
pub use metrics::{MetricsContext, MetricsServerConfig};
pub use pipeline::{TelemetryPipelines, SERVICE_NAME, SERVICE_VERSION};
pub use tracing::init_tracing;
