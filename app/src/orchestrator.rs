//! Startup and shutdown of the whole process.
//!
//! Resources come up in dependency order and are registered on a
//! [`Teardown`] as they do, so a failure half-way through still releases
//! what was already acquired.

use anyhow::{Context, Result};
use consumer::{consume_loop, create_consumer, ConsumeSettings};
use producer::{create_producer, produce_loop};
use pulsar_otel_common::{
    connect, Instrumentation, MetricsContext, MetricsServerConfig, StartGate, SysinfoProbe,
    SystemSampler, TelemetryPipelines, Teardown, TeardownReport, SERVICE_NAME,
};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;

/// Builds the export pipelines from `config` and runs until `shutdown_signal`.
///
/// # Errors
///
/// Returns error if any startup step fails. Shutdown failures are not
/// errors; they are listed in the returned report.
pub async fn run<S>(config: AppConfig, shutdown_signal: S) -> Result<TeardownReport>
where
    S: Future<Output = ()>,
{
    // ---
    let pipelines =
        TelemetryPipelines::install(&config.exporter).context("failed to set up telemetry")?;
    run_with_pipelines(config, pipelines, shutdown_signal).await
}

/// Runs the flow on already-built pipelines.
///
/// Startup order: metrics recorder, broker connection, producer, consumer,
/// then the produce, consume and sampler loops. Resources are released in
/// the reverse order once `shutdown_signal` completes.
///
/// # Errors
///
/// Returns error if any startup step fails, after releasing whatever was
/// acquired before the failure.
pub async fn run_with_pipelines<S>(
    config: AppConfig,
    pipelines: TelemetryPipelines,
    shutdown_signal: S,
) -> Result<TeardownReport>
where
    S: Future<Output = ()>,
{
    // ---
    let shutdown = CancellationToken::new();
    let mut teardown = Teardown::new(config.loops.shutdown_grace());

    {
        let pipelines = pipelines.clone();
        teardown.defer("tracer provider", async move { pipelines.shutdown_tracer().await });
    }
    {
        let pipelines = pipelines.clone();
        teardown.defer("meter provider", async move { pipelines.shutdown_meter().await });
    }

    if let Err(e) = start(&config, &pipelines, &mut teardown, &shutdown).await {
        error!("Startup failed: {e:#}");
        shutdown.cancel();
        log_report(&teardown.run().await);
        return Err(e);
    }

    info!(role = ?config.role, topic = %config.broker.topic, "Running until interrupted");
    shutdown_signal.await;

    info!("Shutting down");
    shutdown.cancel();
    let report = teardown.run().await;
    log_report(&report);

    Ok(report)
}

async fn start(
    config: &AppConfig,
    pipelines: &TelemetryPipelines,
    teardown: &mut Teardown,
    shutdown: &CancellationToken,
) -> Result<()> {
    // ---
    let metrics = MetricsContext::new(
        &config.loops.metrics_namespace,
        SERVICE_NAME,
        &pipelines.meter(),
    )
    .context("failed to create metric instruments")?;

    if let Some(bind) = config.metrics_bind {
        let server = metrics.spawn_metrics_server(MetricsServerConfig::new(bind))?;
        teardown.defer("metrics endpoint", async move {
            server.abort();
            match server.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(e).context("metrics endpoint task failed"),
            }
        });
    }

    let instrumentation = Instrumentation::new(pipelines.tracer(), metrics.clone());

    let broker = connect(&config.broker)
        .await
        .with_context(|| format!("failed to connect to {}", config.broker.url))?;
    metrics.record_connection_change(broker.url(), 1);
    info!(url = broker.url(), "Connected to broker");
    {
        let broker = broker.clone();
        let metrics = metrics.clone();
        teardown.defer("broker", async move {
            metrics.record_connection_change(broker.url(), -1);
            broker.close().await.context("failed to close broker client")
        });
    }

    let gate = StartGate::new();
    let topic = &config.broker.topic;

    if config.role.produces() {
        let mut producer = create_producer(
            broker.as_ref(),
            &instrumentation,
            topic,
            &config.broker.producer_name,
        )
        .await
        .context("failed to create producer")?;

        let task = {
            let instrumentation = instrumentation.clone();
            let gate = gate.clone();
            let shutdown = shutdown.clone();
            let interval = config.loops.publish_interval();
            tokio::spawn(async move {
                if gate.wait(&shutdown).await {
                    produce_loop(producer.as_mut(), &instrumentation, interval, &shutdown).await;
                }
                producer
            })
        };
        teardown.defer("producer", async move {
            let mut producer = task.await.context("produce task failed")?;
            producer.close().await.context("failed to close producer")
        });
    }

    if config.role.consumes() {
        let mut consumer = create_consumer(
            broker.as_ref(),
            &instrumentation,
            topic,
            &config.broker.subscription,
        )
        .await
        .context("failed to create consumer")?;

        let task = {
            let instrumentation = instrumentation.clone();
            let gate = gate.clone();
            let shutdown = shutdown.clone();
            let settings = ConsumeSettings {
                processing_delay: config.loops.processing_delay(),
                receive_retry: config.loops.receive_retry(),
            };
            tokio::spawn(async move {
                if gate.wait(&shutdown).await {
                    consume_loop(consumer.as_mut(), &instrumentation, settings, &shutdown).await;
                }
                consumer
            })
        };
        teardown.defer("consumer", async move {
            let mut consumer = task.await.context("consume task failed")?;
            consumer.close().await.context("failed to close consumer")
        });
    }

    let sampler = SystemSampler::new(
        SysinfoProbe::new(),
        metrics,
        config.loops.sample_interval(),
    );
    let task = {
        let gate = gate.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if gate.wait(&shutdown).await {
                sampler.run(shutdown).await;
            }
        })
    };
    teardown.defer("system sampler", async move {
        task.await.context("sampler task failed")
    });

    gate.open();
    Ok(())
}

fn log_report(report: &TeardownReport) {
    // ---
    if report.is_clean() {
        info!(released = report.released.len(), "Shutdown complete");
        return;
    }
    for failure in &report.failures {
        warn!(resource = failure.resource, "Shutdown step failed: {:#}", failure.error);
    }
}
