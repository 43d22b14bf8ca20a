//! Periodic host sampler.
//!
//! Reads CPU and memory figures on a fixed cadence and writes them to the
//! host gauges of [`MetricsContext`]. Only the latest sample is kept, by
//! the gauges themselves.

use anyhow::{bail, Result};
use std::time::{Duration, Instant};
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observability::MetricsContext;

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    // ---
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Host introspection used by the sampler.
///
/// Each query may fail independently; the sampler skips whichever failed
/// for that tick.
pub trait HostProbe: Send {
    // ---
    /// Host-wide CPU utilization in percent (0.0–100.0).
    ///
    /// `Ok(None)` means no reading is available yet, e.g. right after
    /// start-up when there is no earlier sample to diff against.
    fn cpu_percent(&mut self) -> Result<Option<f64>>;

    fn memory(&mut self) -> Result<MemorySample>;
}

/// [`HostProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    // ---
    system: System,
    last_cpu_refresh: Instant,
}

impl SysinfoProbe {
    // ---
    pub fn new() -> Self {
        // ---
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self {
            system,
            last_cpu_refresh: Instant::now(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn cpu_percent(&mut self) -> Result<Option<f64>> {
        // ---
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            bail!("CPU statistics are not available on this platform");
        }
        // Refreshing again before the minimum interval yields a bogus delta.
        if self.last_cpu_refresh.elapsed() < MINIMUM_CPU_UPDATE_INTERVAL {
            return Ok(None);
        }
        self.system.refresh_cpu_usage();
        self.last_cpu_refresh = Instant::now();
        Ok(Some(f64::from(self.system.global_cpu_usage())))
    }

    fn memory(&mut self) -> Result<MemorySample> {
        // ---
        self.system.refresh_memory();
        let total_bytes = self.system.total_memory();
        if total_bytes == 0 {
            bail!("memory statistics are not available on this platform");
        }
        Ok(MemorySample {
            used_bytes: self.system.used_memory(),
            total_bytes,
        })
    }
}

/// The sampler loop.
pub struct SystemSampler<P> {
    // ---
    probe: P,
    metrics: MetricsContext,
    interval: Duration,
    host_name: Option<String>,
}

impl<P: HostProbe> SystemSampler<P> {
    // ---
    pub fn new(probe: P, metrics: MetricsContext, interval: Duration) -> Self {
        // ---
        Self {
            probe,
            metrics,
            interval,
            host_name: None,
        }
    }

    /// Overrides the `host.name` attribute instead of asking the OS.
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        // ---
        self.host_name = Some(host_name.into());
        self
    }

    /// Samples immediately, then once per interval, until `shutdown` fires.
    ///
    /// Returns the number of ticks taken. Cancellation wins over a tick
    /// due at the same instant, so cancelling `D` after start yields
    /// `ceil(D / interval)` ticks. Probe failures never end the loop.
    pub async fn run(mut self, shutdown: CancellationToken) -> u64 {
        // ---
        let host_name = self.host_name.take().unwrap_or_else(local_host_name);
        info!(host = %host_name, interval = ?self.interval, "System sampler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    self.sample_once(&host_name);
                    ticks += 1;
                }
            }
        }

        info!(ticks, "System sampler stopped");
        ticks
    }

    fn sample_once(&mut self, host_name: &str) {
        // ---
        match self.probe.cpu_percent() {
            Ok(Some(percent)) => {
                let ratio = (percent / 100.0).clamp(0.0, 1.0);
                self.metrics.record_cpu_usage(host_name, ratio);
                debug!(ratio, "Recorded CPU usage");
            }
            Ok(None) => debug!("CPU usage not available yet, skipping"),
            Err(e) => warn!("Failed to read CPU usage: {e:#}"),
        }

        match self.probe.memory() {
            Ok(sample) => {
                self.metrics
                    .record_memory(host_name, sample.used_bytes, sample.total_bytes);
                debug!(used = sample.used_bytes, total = sample.total_bytes, "Recorded memory");
            }
            Err(e) => warn!("Failed to read memory statistics: {e:#}"),
        }
    }
}

fn local_host_name() -> String {
    // ---
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
