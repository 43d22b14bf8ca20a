//! Command line of the `pulsar-otel` binary.

use clap::Parser;
use pulsar_otel_common::{BrokerConfig, ColorWhen, ExporterConfig, LoopConfig};
use std::net::SocketAddr;

/// Which side of the message flow this process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Producer and consumer in the same process
    #[default]
    Both,

    /// Publish only
    Producer,

    /// Consume only
    Consumer,
}

impl Role {
    // ---
    pub fn produces(self) -> bool {
        // ---
        matches!(self, Role::Both | Role::Producer)
    }

    pub fn consumes(self) -> bool {
        // ---
        matches!(self, Role::Both | Role::Consumer)
    }
}

/// Traced Pulsar producer/consumer with OpenTelemetry export
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    // ---
    #[command(flatten)]
    pub broker: BrokerConfig,

    #[command(flatten)]
    pub exporter: ExporterConfig,

    #[command(flatten)]
    pub loops: LoopConfig,

    /// Side of the flow to run
    #[arg(long, env = "APP_ROLE", value_enum, default_value = "both")]
    pub role: Role,

    /// Serve the Prometheus mirror on `GET /metrics` at this address
    #[arg(long, env = "METRICS_BIND")]
    pub metrics_bind: Option<SocketAddr>,

    /// Coloring of log output
    #[arg(long, env = "APP_COLOR", value_enum, default_value = "auto")]
    pub color: ColorWhen,
}
