//! Startup ordering and shutdown bookkeeping for the orchestrator.
//!
//! Resources are registered on a [`Teardown`] as they come up. At shutdown
//! they are released in reverse order of registration, each bounded by the
//! same grace period. A failing step is recorded and the remaining steps
//! still run.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct Step {
    name: &'static str,
    future: BoxFuture<'static, anyhow::Result<()>>,
}

/// LIFO list of release steps.
pub struct Teardown {
    // ---
    grace: Duration,
    steps: Vec<Step>,
}

/// One release step that failed or timed out.
#[derive(Debug)]
pub struct TeardownFailure {
    // ---
    pub resource: &'static str,
    pub error: anyhow::Error,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}: {:#}", self.resource, self.error)
    }
}

/// Outcome of [`Teardown::run`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    // ---
    /// Steps in the order they ran.
    pub released: Vec<&'static str>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    // ---
    pub fn is_clean(&self) -> bool {
        // ---
        self.failures.is_empty()
    }
}

impl Teardown {
    // ---
    /// Creates an empty teardown where each step gets `grace` to finish.
    pub fn new(grace: Duration) -> Self {
        // ---
        Self {
            grace,
            steps: Vec::new(),
        }
    }

    /// Registers a release step. Steps run last-registered first.
    ///
    /// The future is not polled until [`Teardown::run`].
    pub fn defer<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // ---
        debug!(resource = name, "Registered for teardown");
        self.steps.push(Step {
            name,
            future: Box::pin(future),
        });
    }

    pub fn len(&self) -> usize {
        // ---
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.steps.is_empty()
    }

    /// Runs every step in reverse registration order.
    pub async fn run(mut self) -> TeardownReport {
        // ---
        let mut report = TeardownReport::default();

        while let Some(step) = self.steps.pop() {
            let outcome = match tokio::time::timeout(self.grace, step.future).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "did not finish within {:?}",
                    self.grace
                )),
            };

            report.released.push(step.name);
            match outcome {
                Ok(()) => debug!(resource = step.name, "Released"),
                Err(error) => {
                    error!(resource = step.name, "Failed to release: {error:#}");
                    report.failures.push(TeardownFailure {
                        resource: step.name,
                        error,
                    });
                }
            }
        }

        report
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        // ---
        if !self.steps.is_empty() {
            warn!(
                pending = self.steps.len(),
                "Teardown dropped without running its steps"
            );
        }
    }
}

/// One-shot gate that holds loops back until startup has finished.
#[derive(Clone)]
pub struct StartGate {
    // ---
    tx: watch::Sender<bool>,
}

impl StartGate {
    // ---
    pub fn new() -> Self {
        // ---
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Releases every current and future waiter.
    pub fn open(&self) {
        // ---
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        // ---
        *self.tx.borrow()
    }

    /// Waits until the gate opens.
    ///
    /// Returns `false` if `shutdown` fired first.
    pub async fn wait(&self, shutdown: &CancellationToken) -> bool {
        // ---
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => false,
            opened = rx.wait_for(|open| *open) => opened.is_ok(),
        }
    }
}

impl Default for StartGate {
    fn default() -> Self {
        // ---
        Self::new()
    }
}
