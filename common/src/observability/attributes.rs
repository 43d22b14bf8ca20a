//! Span attribute keys for messaging operations.
//!
//! Standard keys come from the OpenTelemetry messaging conventions; the
//! `pulsar.*` keys carry broker details those conventions do not name.

pub use opentelemetry_semantic_conventions::attribute::{
    MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID, MESSAGING_OPERATION_TYPE, MESSAGING_SYSTEM,
};

/// Broker-assigned id of the message, as opposed to the application id.
pub const BROKER_MESSAGE_ID: &str = "pulsar.message_id";
pub const BROKER_SUBSCRIPTION: &str = "pulsar.subscription";
pub const BROKER_PRODUCER: &str = "pulsar.producer";
