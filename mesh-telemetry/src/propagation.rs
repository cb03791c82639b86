//! Text-map propagator chain

use opentelemetry::Context;
use opentelemetry::propagation::text_map_propagator::FieldIter;
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

/// Header written by the error-reporting backend's own SDKs.
pub const SENTRY_TRACE_HEADER: &str = "sentry-trace";

/// Build the propagator chain: W3C trace context and baggage, plus the
/// error-reporting vendor header when `with_reporting` is set.
pub fn build_propagator(with_reporting: bool) -> TextMapCompositePropagator {
    let mut propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>> = vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ];

    if with_reporting {
        propagators.push(Box::new(SentryPropagator::new()));
    }

    TextMapCompositePropagator::new(propagators)
}

/// Propagates `sentry-trace: {trace_id}-{span_id}-{sampled}`.
///
/// On extraction the header is only consulted when no earlier propagator in
/// the chain produced a parent span.
#[derive(Debug)]
pub struct SentryPropagator {
    fields: Vec<String>,
}

impl SentryPropagator {
    /// Create a new propagator
    pub fn new() -> Self {
        Self {
            fields: vec![SENTRY_TRACE_HEADER.to_string()],
        }
    }
}

impl Default for SentryPropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl TextMapPropagator for SentryPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let span_context = span.span_context();
        if !span_context.is_valid() {
            return;
        }

        let sampled = if span_context.is_sampled() { "1" } else { "0" };
        injector.set(
            SENTRY_TRACE_HEADER,
            format!(
                "{}-{}-{}",
                span_context.trace_id(),
                span_context.span_id(),
                sampled
            ),
        );
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        if cx.span().span_context().is_valid() {
            return cx.clone();
        }

        extractor
            .get(SENTRY_TRACE_HEADER)
            .and_then(parse_sentry_trace)
            .map(|span_context| cx.with_remote_span_context(span_context))
            .unwrap_or_else(|| cx.clone())
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}

fn parse_sentry_trace(value: &str) -> Option<SpanContext> {
    let mut parts = value.trim().split('-');
    let trace_hex = parts.next().filter(|p| p.len() == 32)?;
    let span_hex = parts.next().filter(|p| p.len() == 16)?;
    let trace_id = TraceId::from_hex(trace_hex).ok()?;
    let span_id = SpanId::from_hex(span_hex).ok()?;
    let flags = match parts.next() {
        Some("1") => TraceFlags::SAMPLED,
        Some("0") | None => TraceFlags::default(),
        Some(_) => return None,
    };
    if parts.next().is_some() || trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
        return None;
    }

    Some(SpanContext::new(
        trace_id,
        span_id,
        flags,
        true,
        TraceState::default(),
    ))
}
