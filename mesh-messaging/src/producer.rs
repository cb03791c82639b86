//! Producer spans.

use crate::error::MessagingResult;
use crate::message::{HeaderInjector, ProducerMessage};
use crate::traits::Producer;
use async_trait::async_trait;
use mesh_telemetry::ObservabilityContext;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use std::fmt;
use std::sync::Arc;

/// Name of the span opened for every produced message.
pub const PRODUCE_SPAN_NAME: &str = "produce message";

/// Open a producer span for `message` and write its trace context into the
/// message headers.
///
/// Propagation headers are appended after any existing ones. The returned
/// context holds the span: set its status from the send outcome and end it
/// with `cx.span().end()`.
pub fn start_producer_span(
    obs: &ObservabilityContext,
    parent: &Context,
    key: &str,
    message: &mut ProducerMessage,
) -> Context {
    let span = obs
        .tracer()
        .span_builder(PRODUCE_SPAN_NAME)
        .with_kind(SpanKind::Producer)
        .with_attributes([
            KeyValue::new("kafka.topic", message.topic.clone()),
            KeyValue::new("kafka.key", key.to_string()),
        ])
        .start_with_context(obs.tracer(), parent);
    let cx = parent.with_span(span);

    obs.inject(&cx, &mut HeaderInjector(&mut message.headers));
    cx
}

/// Wraps a [`Producer`] so every send runs inside a producer span.
pub struct TracedProducer<P> {
    inner: P,
    obs: Arc<ObservabilityContext>,
}

impl<P: Producer> TracedProducer<P> {
    pub fn new(inner: P, obs: Arc<ObservabilityContext>) -> Self {
        Self { inner, obs }
    }

    /// Wrapped producer
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Send `message` in a span that is a child of `parent`.
    pub async fn send_with_context(
        &self,
        parent: &Context,
        mut message: ProducerMessage,
    ) -> MessagingResult<()> {
        let key = message
            .key
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default()
            .into_owned();
        let cx = start_producer_span(&self.obs, parent, &key, &mut message);

        let result = self.inner.send(message).await;

        let span = cx.span();
        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::error(err.to_string()));
            }
        }
        span.end();

        result
    }
}

#[async_trait]
impl<P: Producer> Producer for TracedProducer<P> {
    /// Send `message` in a span that is a child of the current context.
    async fn send(&self, message: ProducerMessage) -> MessagingResult<()> {
        let parent = Context::current();
        self.send_with_context(&parent, message).await
    }
}

impl<P: fmt::Debug> fmt::Debug for TracedProducer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedProducer")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
