//! Producer side of the traced message flow.
//!
//! Wraps every send in a `publish` span, injects the span's trace context
//! into the message properties and records publish metrics.

pub mod publish;

pub use publish::{create_producer, publish_traced};

use pulsar_otel_common::{Instrumentation, MessageProducer};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Payload of the `n`-th generated message.
pub fn message_payload(n: u64) -> String {
    // ---
    format!("Hello, OpenTelemetry! Message {n}")
}

/// Publishes a numbered message every `interval` until `shutdown` fires.
///
/// The first message goes out one interval after the call. Publish errors
/// are logged by [`publish_traced`] and do not stop the loop.
///
/// # Arguments
///
/// * `producer` - Open producer for the destination topic
/// * `instrumentation` - Tracer, propagator and metrics for this process
/// * `interval` - Delay between two publishes
/// * `shutdown` - Stops the loop; a publish already in flight completes
///
/// Returns the number of publish attempts.
pub async fn produce_loop(
    producer: &mut dyn MessageProducer,
    instrumentation: &Instrumentation,
    interval: Duration,
    shutdown: &CancellationToken,
) -> u64 {
    // ---
    info!(topic = producer.topic(), interval = ?interval, "Produce loop started");

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                attempts += 1;
                let message_id = format!("msg-{attempts}");
                let payload = message_payload(attempts).into_bytes();

                if let Err(e) =
                    publish_traced(producer, instrumentation, &message_id, payload, None).await
                {
                    debug!(message_id = %message_id, "Continuing after publish failure: {e}");
                }
            }
        }
    }

    info!(attempts, "Produce loop stopped");
    attempts
}
