//! Process-wide telemetry handles passed explicitly to every component.

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracer;
use std::sync::Arc;

use crate::observability::MetricsContext;
use crate::propagation::{self, Carrier};

/// Builds the propagator installed for message properties:
/// W3C trace context followed by W3C baggage.
pub fn default_propagator() -> TextMapCompositePropagator {
    // ---
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Tracer, propagator and metrics recorder bundled together.
///
/// Built once at startup, cloned into each task, torn down by dropping the
/// pipelines that produced it. Cloning is cheap: every field is shared.
#[derive(Clone)]
pub struct Instrumentation {
    // ---
    tracer: SdkTracer,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    metrics: MetricsContext,
}

impl Instrumentation {
    // ---
    /// Bundles `tracer` and `metrics` with the default propagator.
    pub fn new(tracer: SdkTracer, metrics: MetricsContext) -> Self {
        // ---
        Self::with_propagator(tracer, metrics, Arc::new(default_propagator()))
    }

    pub fn with_propagator(
        tracer: SdkTracer,
        metrics: MetricsContext,
        propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    ) -> Self {
        // ---
        Self {
            tracer,
            propagator,
            metrics,
        }
    }

    pub fn tracer(&self) -> &SdkTracer {
        // ---
        &self.tracer
    }

    pub fn metrics(&self) -> &MetricsContext {
        // ---
        &self.metrics
    }

    /// Injects the span context of `cx` into `carrier`.
    pub fn inject<C: Carrier + ?Sized>(&self, cx: &Context, carrier: &mut C) {
        // ---
        propagation::inject_context(self.propagator.as_ref(), cx, carrier);
    }

    /// Extracts a parent context from `carrier`; see [`propagation::extract_context`].
    pub fn extract<C: Carrier + ?Sized>(&self, carrier: &C) -> Context {
        // ---
        propagation::extract_context(self.propagator.as_ref(), carrier)
    }
}
