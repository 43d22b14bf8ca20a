//! Traced Pulsar producer/consumer - CLI binary.
//!
//! Publishes a message every interval, consumes it on a shared
//! subscription and exports spans and metrics until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use pulsar_otel::AppConfig;
use pulsar_otel_common::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let config = AppConfig::parse();
    init_tracing(config.color)?;

    info!("Starting {}", env!("CARGO_PKG_NAME"));
    info!("Broker: {}", config.broker.url);
    info!(
        "Topic: {} (subscription {})",
        config.broker.topic, config.broker.subscription
    );
    match config.exporter.endpoint.as_deref() {
        Some(endpoint) => info!("OTLP endpoint: {endpoint}"),
        None => info!("No OTLP endpoint set, exporting to stdout"),
    }

    let report = pulsar_otel::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C, shutting down: {e}");
        }
    })
    .await?;

    if !report.is_clean() {
        info!(
            failed = report.failures.len(),
            "Exited with shutdown errors"
        );
    }
    Ok(())
}
