//! Trace-context carriers
//!
//! A carrier is a flat string map holding a serialized trace context and its
//! baggage. The key scheme is whatever the configured propagator chain writes:
//! W3C `traceparent` / `tracestate`, W3C `baggage`, and `sentry-trace` when
//! error reporting is enabled.
//!
//! Extraction never fails. Missing or malformed keys leave the parent context
//! untouched, which for a fresh [`Context`] means "no parent trace".

use std::collections::HashMap;

use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};

/// Owned string-keyed carrier.
pub type HeaderCarrier = HashMap<String, String>;

/// Write the span context and baggage of `cx` into `carrier`.
pub fn inject_context(
    propagator: &dyn TextMapPropagator,
    cx: &Context,
    carrier: &mut dyn Injector,
) {
    propagator.inject_context(cx, carrier);
}

/// Read a context from `carrier`, starting from an empty root context.
pub fn extract_context(propagator: &dyn TextMapPropagator, carrier: &dyn Extractor) -> Context {
    extract_context_with(propagator, &Context::new(), carrier)
}

/// Read a context from `carrier`, deriving it from `parent`.
pub fn extract_context_with(
    propagator: &dyn TextMapPropagator,
    parent: &Context,
    carrier: &dyn Extractor,
) -> Context {
    propagator.extract_with_context(parent, carrier)
}
