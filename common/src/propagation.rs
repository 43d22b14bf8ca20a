//! Trace-context propagation through message properties.
//!
//! A [`Carrier`] is any string-to-string mapping that can travel inside a
//! message. The propagator writes `traceparent`/`tracestate`/`baggage`
//! headers into it on the producer side and reads them back on the
//! consumer side. Header content is never validated here: an empty or
//! malformed header simply means "no parent".

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

/// Key/value adapter used to move a trace context through message metadata.
///
/// Keys are case-sensitive and unique. A `get` on an absent key returns the
/// empty string, never an error.
pub trait Carrier {
    // ---
    /// Returns the value stored under `key`, or `""` when absent.
    fn get(&self, key: &str) -> &str;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&mut self, key: &str, value: String);

    /// Enumerates every key that currently holds a value. Order is unspecified.
    fn keys(&self) -> Vec<&str>;
}

impl Carrier for BTreeMap<String, String> {
    fn get(&self, key: &str) -> &str {
        // ---
        BTreeMap::get(self, key).map(String::as_str).unwrap_or("")
    }

    fn set(&mut self, key: &str, value: String) {
        // ---
        self.insert(key.to_string(), value);
    }

    fn keys(&self) -> Vec<&str> {
        // ---
        BTreeMap::keys(self).map(String::as_str).collect()
    }
}

impl<S: BuildHasher> Carrier for HashMap<String, String, S> {
    fn get(&self, key: &str) -> &str {
        // ---
        HashMap::get(self, key).map(String::as_str).unwrap_or("")
    }

    fn set(&mut self, key: &str, value: String) {
        // ---
        self.insert(key.to_string(), value);
    }

    fn keys(&self) -> Vec<&str> {
        // ---
        HashMap::keys(self).map(String::as_str).collect()
    }
}

/// Writes the span context of `cx` into `carrier`.
pub fn inject_context<C: Carrier + ?Sized>(
    propagator: &dyn TextMapPropagator,
    cx: &Context,
    carrier: &mut C,
) {
    // ---
    propagator.inject_context(cx, &mut CarrierInjector(carrier));
}

/// Reads a parent context out of `carrier`.
///
/// The returned context is built on an empty root, so a carrier without
/// trace headers yields a context with no active span and any span started
/// from it becomes the root of a new trace.
pub fn extract_context<C: Carrier + ?Sized>(
    propagator: &dyn TextMapPropagator,
    carrier: &C,
) -> Context {
    // ---
    propagator.extract_with_context(&Context::new(), &CarrierExtractor(carrier))
}

struct CarrierInjector<'a, C: ?Sized>(&'a mut C);

impl<C: Carrier + ?Sized> Injector for CarrierInjector<'_, C> {
    fn set(&mut self, key: &str, value: String) {
        self.0.set(key, value);
    }
}

struct CarrierExtractor<'a, C: ?Sized>(&'a C);

impl<C: Carrier + ?Sized> Extractor for CarrierExtractor<'_, C> {
    fn get(&self, key: &str) -> Option<&str> {
        // ---
        match self.0.get(key) {
            "" => None,
            value => Some(value),
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys()
    }
}
