//! Bridge from `tracing` events to the [`LogHandler`]
//!
//! Events become [`LogRecord`]s:
//! - the `message` field is the record message;
//! - fields of enclosing spans come first, root span outermost;
//! - dotted field names (`user.id`) become nested groups;
//! - fields recorded as `&dyn Error` become captured errors.
//!
//! The OpenTelemetry context current at the time of the event is handed to
//! the handler, so records emitted inside an instrumented future carry its
//! trace.

use crate::Level;
use crate::handler::LogHandler;
use crate::record::{Attr, AttrValue, LogRecord};
use chrono::Utc;
use std::error::Error;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::registry::LookupSpan;

/// Recorded fields of a span, stored in its extensions.
#[derive(Debug, Default, Clone)]
struct SpanFields(Vec<(String, AttrValue)>);

/// `tracing_subscriber` layer feeding a [`LogHandler`].
#[derive(Debug, Clone)]
pub struct LogLayer {
    handler: LogHandler,
}

impl LogLayer {
    pub fn new(handler: LogHandler) -> Self {
        Self { handler }
    }

    /// Underlying handler
    pub fn handler(&self) -> &LogHandler {
        &self.handler
    }
}

impl<S> Layer<S> for LogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: LayerContext<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: LayerContext<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);

        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.0.extend(visitor.fields),
            None => extensions.insert(SpanFields(visitor.fields)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let level = Level::from(*metadata.level());
        if !self.handler.enabled(level) {
            return;
        }

        let mut fields = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(span_fields) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.0.iter().cloned());
                }
            }
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        fields.extend(visitor.fields);

        let mut record = LogRecord::new(level, visitor.message.unwrap_or_default())
            .with_target(metadata.target())
            .with_timestamp(Utc::now());
        record.attrs = nest_dotted(fields);

        let cx = opentelemetry::Context::current();
        if let Err(err) = self.handler.handle(&cx, record) {
            // Nowhere left to log this.
            eprintln!("mesh-log: failed to write record: {err}");
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, AttrValue)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: AttrValue) {
        self.fields.push((field.name().to_string(), value));
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.push(field, AttrValue::Str(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, AttrValue::I64(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, AttrValue::U64(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, AttrValue::F64(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, AttrValue::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        let attr = Attr::error(field.name(), value);
        self.fields.push((attr.key, attr.value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.push(field, AttrValue::Str(format!("{value:?}")));
        }
    }
}

/// Turn dotted keys into nested groups, merging groups with the same name.
fn nest_dotted(fields: Vec<(String, AttrValue)>) -> Vec<Attr> {
    let mut attrs = Vec::new();
    for (key, value) in fields {
        let path: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
        if path.is_empty() {
            continue;
        }
        insert_path(&mut attrs, &path, value);
    }
    attrs
}

fn insert_path(attrs: &mut Vec<Attr>, path: &[&str], value: AttrValue) {
    let (head, rest) = match path {
        [] => return,
        [leaf] => {
            attrs.push(Attr::new(*leaf, value));
            return;
        }
        [head, rest @ ..] => (*head, rest),
    };

    let existing = attrs
        .iter_mut()
        .rev()
        .find(|a| a.key == head && matches!(a.value, AttrValue::Group(_)));

    match existing {
        Some(Attr {
            value: AttrValue::Group(children),
            ..
        }) => insert_path(children, rest, value),
        _ => {
            let mut children = Vec::new();
            insert_path(&mut children, rest, value);
            attrs.push(Attr::group(head, children));
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => Level::Error,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::INFO => Level::Info,
            tracing::Level::DEBUG => Level::Debug,
            _ => Level::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{JsonSink, MemoryWriter};
    use mesh_telemetry::report::{ReportEvent, Reporter};
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<ReportEvent>>,
    }

    impl Reporter for Recorder {
        fn capture_event(&self, event: ReportEvent) {
            self.events.lock().push(event);
        }
    }

    fn setup(
        min_level: Level,
    ) -> (impl Subscriber + Send + Sync + 'static, MemoryWriter, Arc<Recorder>) {
        let out = MemoryWriter::new();
        let reporter = Arc::new(Recorder::default());
        let handler = LogHandler::new(Arc::new(JsonSink::new(out.clone(), min_level)))
            .with_reporter(reporter.clone());
        let subscriber = tracing_subscriber::registry().with(LogLayer::new(handler));
        (subscriber, out, reporter)
    }

    #[test]
    fn test_event_fields_and_groups() {
        let (subscriber, out, _) = setup(Level::Debug);

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("request", request_id = "r-1");
            let _guard = span.enter();
            tracing::info!(user.id = 7, user.name = "ada", retries = 2u64, "checkout started");
        });

        let line = &out.json_lines()[0];
        assert_eq!(line["msg"], "checkout started");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["request_id"], "r-1");
        assert_eq!(line["user"]["id"], 7);
        assert_eq!(line["user"]["name"], "ada");
        assert_eq!(line["retries"], 2);
    }

    #[test]
    fn test_level_filtering() {
        let (subscriber, out, _) = setup(Level::Info);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("hidden");
            tracing::info!("shown");
        });

        let lines = out.json_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["msg"], "shown");
    }

    #[test]
    fn test_error_field_is_escalated() {
        let (subscriber, _, reporter) = setup(Level::Info);
        let err = std::io::Error::other("socket closed");

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(error = &err as &(dyn Error + 'static), "publish failed");
        });

        let events = reporter.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "publish failed");
        assert_eq!(events[0].exceptions[0].value, "socket closed");
    }

    #[test]
    fn test_current_otel_context_is_used() {
        let (subscriber, out, _) = setup(Level::Info);
        let cx = opentelemetry::Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ));

        tracing::subscriber::with_default(subscriber, || {
            let _attached = cx.attach();
            tracing::info!("inside");
        });

        let line = &out.json_lines()[0];
        assert_eq!(line["trace_id"], "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(line["span_id"], "b7ad6b7169203331");
    }

    #[test]
    fn test_nest_dotted_merges() {
        let attrs = nest_dotted(vec![
            ("a.b".to_string(), AttrValue::I64(1)),
            ("a.c".to_string(), AttrValue::I64(2)),
            ("d".to_string(), AttrValue::Bool(true)),
        ]);

        assert_eq!(attrs.len(), 2);
        match &attrs[0].value {
            AttrValue::Group(children) => assert_eq!(children.len(), 2),
            other => panic!("expected group, got {other:?}"),
        }
    }
}
