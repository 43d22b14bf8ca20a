//! Consumer side of the traced message flow.
//!
//! Continues the producer's trace from the message properties, processes
//! each delivery under a `process` span and records consume metrics once
//! the message is acknowledged.

pub mod process;

pub use process::{
    consume_next, create_consumer, ConsumeOutcome, ConsumeSettings, UNKNOWN_MESSAGE_ID,
};

use pulsar_otel_common::{Instrumentation, MessageConsumer};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Consumes deliveries until `shutdown` fires.
///
/// Receive and acknowledgment failures are logged by [`consume_next`] and
/// never end the loop. A message already being processed when `shutdown`
/// fires is finished first.
///
/// Returns the number of acknowledged messages.
pub async fn consume_loop(
    consumer: &mut dyn MessageConsumer,
    instrumentation: &Instrumentation,
    settings: ConsumeSettings,
    shutdown: &CancellationToken,
) -> u64 {
    // ---
    info!(
        topic = consumer.topic(),
        subscription = consumer.subscription(),
        "Consume loop started"
    );

    let mut acknowledged = 0u64;
    loop {
        match consume_next(consumer, instrumentation, &settings, shutdown).await {
            ConsumeOutcome::Cancelled => break,
            ConsumeOutcome::Processed { .. } => acknowledged += 1,
            ConsumeOutcome::ReceiveFailed | ConsumeOutcome::AckFailed { .. } => {}
        }
    }

    info!(acknowledged, "Consume loop stopped");
    acknowledged
}
