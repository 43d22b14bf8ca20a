//! Traced publish/subscribe demo.
//!
//! Wires the producer, the consumer and the host sampler to one broker
//! connection and one set of telemetry pipelines, and tears them down in
//! reverse order on shutdown.

pub mod config;
pub mod orchestrator;

pub use config::{AppConfig, Role};
pub use orchestrator::{run, run_with_pipelines};
