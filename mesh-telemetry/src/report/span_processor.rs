//! Span processor forwarding locally rooted span trees as transactions

use super::client::Reporter;
use super::event::{SpanRecord, TransactionEvent};
use opentelemetry::Context;
use opentelemetry::trace::{Span as _, SpanId, TraceContextExt, TraceId};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const MAX_SPANS_PER_TRANSACTION: usize = 1000;
const MAX_PENDING_TRACES: usize = 10_000;

#[derive(Debug, Default)]
struct State {
    local_roots: HashSet<SpanId>,
    pending: HashMap<TraceId, Vec<SpanRecord>>,
}

/// Groups finished spans under their local root and reports the tree when
/// the root ends.
///
/// A span is a local root when its parent is absent or remote.
#[derive(Debug)]
pub struct ReportingSpanProcessor {
    reporter: Arc<dyn Reporter>,
    state: Mutex<State>,
}

impl ReportingSpanProcessor {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            state: Mutex::new(State::default()),
        }
    }
}

impl SpanProcessor for ReportingSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        let parent = cx.span();
        let parent_context = parent.span_context();
        if parent_context.is_valid() && !parent_context.is_remote() {
            return;
        }

        let span_context = span.span_context();
        if span_context.is_valid() {
            self.state.lock().local_roots.insert(span_context.span_id());
        }
    }

    fn on_end(&self, span: SpanData) {
        let trace_id = span.span_context.trace_id();
        let mut state = self.state.lock();

        if state.local_roots.remove(&span.span_context.span_id()) {
            let children = state.pending.remove(&trace_id).unwrap_or_default();
            drop(state);
            self.reporter
                .capture_transaction(TransactionEvent::from_root(&span, children));
            return;
        }

        if !state.pending.contains_key(&trace_id) && state.pending.len() >= MAX_PENDING_TRACES {
            return;
        }
        let bucket = state.pending.entry(trace_id).or_default();
        if bucket.len() < MAX_SPANS_PER_TRANSACTION {
            bucket.push(SpanRecord::from(&span));
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.shutdown_with_timeout(Duration::from_secs(5))
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        let mut state = self.state.lock();
        state.local_roots.clear();
        state.pending.clear();
        Ok(())
    }
}
