//! Log subscriber initialization.
//!
//! Centralizes logging config so every role of the binary behaves the same.

use crate::ColorWhen;
use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
///
/// The broker client and the OTLP transport are chatty at `info`.
const DEFAULT_FILTER: &str = "info,pulsar=warn,h2=warn,tonic=warn";

/// Initialize the log subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`.
/// - ANSI color controlled by `ColorWhen`.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to install log subscriber")?;

    Ok(())
}
