//! Trace-aware log handler
//!
//! [`LogHandler`] sits in front of a [`LogSink`]. For every record it
//!
//! 1. escalates warnings and errors to the error reporter, when one is set;
//! 2. appends `trace_id` and `span_id` when a span is active in the given
//!    context;
//! 3. hands the record to the sink.

use crate::Level;
use crate::error::LogResult;
use crate::record::{Attr, ErrorAttr, LogRecord};
use crate::sink::LogSink;
use crate::traced::capture_frames;
use mesh_telemetry::report::{CapturedException, ReportEvent, ReportLevel, Reporter, Stacktrace};
use opentelemetry::Context;
use opentelemetry::trace::TraceContextExt;
use serde_json::Value;
use std::sync::Arc;

/// Log handler wrapping a sink.
#[derive(Debug, Clone)]
pub struct LogHandler {
    sink: Arc<dyn LogSink>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl LogHandler {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            reporter: None,
        }
    }

    /// Escalate warning and error records to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Escalate to `reporter` when present.
    pub fn with_optional_reporter(mut self, reporter: Option<Arc<dyn Reporter>>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Whether the sink writes records at `level`.
    pub fn enabled(&self, level: Level) -> bool {
        self.sink.enabled(level)
    }

    /// Handle `record` emitted under `cx`.
    pub fn handle(&self, cx: &Context, mut record: LogRecord) -> LogResult<()> {
        let span = cx.span();
        let span_context = span.span_context();

        if record.level >= Level::Warn
            && record.level != Level::Off
            && let Some(ref reporter) = self.reporter
        {
            let mut event = report_event(&record);
            if span_context.is_valid() {
                event = event.with_trace(
                    span_context.trace_id().to_string(),
                    span_context.span_id().to_string(),
                );
            }
            reporter.capture_event(event);
        }

        if span_context.is_valid() {
            record.add_attr("trace_id", span_context.trace_id().to_string());
            record.add_attr("span_id", span_context.span_id().to_string());
        }

        self.sink.handle(&record)
    }

    /// Handler whose sink writes `attrs` with every record.
    pub fn with_attrs(&self, attrs: Vec<Attr>) -> Self {
        Self {
            sink: self.sink.with_attrs(attrs),
            reporter: self.reporter.clone(),
        }
    }

    /// Handler whose sink nests following attributes under `name`.
    pub fn with_group(&self, name: &str) -> Self {
        Self {
            sink: self.sink.with_group(name),
            reporter: self.reporter.clone(),
        }
    }
}

fn report_event(record: &LogRecord) -> ReportEvent {
    let level = if record.level >= Level::Error {
        ReportLevel::Error
    } else {
        ReportLevel::Warning
    };

    let mut event = ReportEvent::new(level, record.message.clone()).with_timestamp(record.timestamp);
    if !record.target.is_empty() {
        event = event.with_logger(record.target.clone());
    }

    let mut exception = None;
    for attr in &record.attrs {
        if let Some(err) = attr.find_error() {
            exception = Some(err);
        }
        let value: Value = attr.value.to_json();
        event.extra.insert(attr.key.clone(), value);
    }

    if let Some(err) = exception {
        event.exceptions = exception_values(err);
    }

    event
}

/// Exception values innermost cause first; the logged error comes last and
/// carries the stack.
fn exception_values(err: &ErrorAttr) -> Vec<CapturedException> {
    let mut values: Vec<CapturedException> = err
        .sources
        .iter()
        .rev()
        .map(|cause| CapturedException {
            ty: cause.type_name.clone(),
            value: cause.message.clone(),
            stacktrace: None,
        })
        .collect();

    // Errors without a creation stack get the stack of the logging call.
    let frames = if err.frames.is_empty() {
        capture_frames()
    } else {
        err.frames.clone()
    };
    values.push(CapturedException {
        ty: err.error.type_name.clone(),
        value: err.error.message.clone(),
        stacktrace: (!frames.is_empty()).then_some(Stacktrace { frames }),
    });

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{JsonSink, MemoryWriter};
    use crate::traced::TracedError;
    use mesh_telemetry::report::TransactionEvent;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<ReportEvent>>,
    }

    impl Reporter for Recorder {
        fn capture_event(&self, event: ReportEvent) {
            self.events.lock().push(event);
        }

        fn capture_transaction(&self, _transaction: TransactionEvent) {}
    }

    fn handler(min_level: Level) -> (LogHandler, MemoryWriter, Arc<Recorder>) {
        let out = MemoryWriter::new();
        let reporter = Arc::new(Recorder::default());
        let handler = LogHandler::new(Arc::new(JsonSink::new(out.clone(), min_level)))
            .with_reporter(reporter.clone());
        (handler, out, reporter)
    }

    fn traced_context() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn test_trace_ids_added_when_span_active() {
        let (handler, out, _) = handler(Level::Info);

        handler
            .handle(&traced_context(), LogRecord::new(Level::Info, "x"))
            .unwrap();

        let line = &out.json_lines()[0];
        assert_eq!(line["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(line["span_id"], "00f067aa0ba902b7");
    }

    #[test]
    fn test_no_trace_ids_without_span() {
        let (handler, out, _) = handler(Level::Info);

        handler
            .handle(&Context::new(), LogRecord::new(Level::Info, "x"))
            .unwrap();

        let line = &out.json_lines()[0];
        assert!(line.get("trace_id").is_none());
        assert!(line.get("span_id").is_none());
    }

    #[test]
    fn test_info_not_escalated() {
        let (handler, _, reporter) = handler(Level::Info);

        handler
            .handle(&traced_context(), LogRecord::new(Level::Info, "x"))
            .unwrap();

        assert!(reporter.events.lock().is_empty());
    }

    #[test]
    fn test_warning_escalated_with_attrs() {
        let (handler, out, reporter) = handler(Level::Info);

        let record = LogRecord::new(Level::Warn, "disk almost full")
            .with_attr(Attr::new("mount", "/data"))
            .with_attr(Attr::group("usage", vec![Attr::new("pct", 93i64)]));
        handler.handle(&Context::new(), record).unwrap();

        let events = reporter.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, ReportLevel::Warning);
        assert_eq!(events[0].message, "disk almost full");
        assert_eq!(events[0].extra["mount"], "/data");
        assert_eq!(events[0].extra["usage"]["pct"], 93);
        assert_eq!(events[0].fingerprint, vec!["{{ default }}", "disk almost full"]);
        assert!(events[0].exceptions.is_empty());
        assert!(events[0].contexts.trace.is_none());

        // the record is still written
        assert_eq!(out.json_lines().len(), 1);
    }

    #[test]
    fn test_error_escalated_with_exception_and_trace() {
        let (handler, out, reporter) = handler(Level::Info);

        let err = TracedError::new(std::io::Error::other("connection reset"));
        let record = LogRecord::new(Level::Error, "payment failed").with_attr(Attr::error("error", &err));
        handler.handle(&traced_context(), record).unwrap();

        let events = reporter.events.lock();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.level, ReportLevel::Error);
        assert_eq!(event.extra["error"], "connection reset");
        assert_eq!(event.exceptions.len(), 1);
        assert_eq!(event.exceptions[0].value, "connection reset");

        let trace = event.contexts.trace.as_ref().unwrap();
        assert_eq!(trace.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(trace.span_id, "00f067aa0ba902b7");

        let line = &out.json_lines()[0];
        assert_eq!(line["error"], "connection reset");
        assert_eq!(line["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn test_plain_error_gets_call_site_stack() {
        let (handler, _, reporter) = handler(Level::Info);

        let err = std::io::Error::other("payment declined");
        let record = LogRecord::new(Level::Error, "charge failed").with_attr(Attr::error("error", &err));
        handler.handle(&Context::new(), record).unwrap();

        let events = reporter.events.lock();
        let exception = &events[0].exceptions[0];
        assert_eq!(exception.value, "payment declined");

        let stacktrace = exception.stacktrace.as_ref().unwrap();
        assert!(!stacktrace.frames.is_empty());
        // capture and handler frames are stripped from the innermost end
        let innermost = stacktrace.frames.last().unwrap();
        assert!(
            !innermost
                .function
                .as_deref()
                .unwrap_or_default()
                .starts_with("backtrace::")
        );
    }

    #[test]
    fn test_without_reporter_only_writes() {
        let out = MemoryWriter::new();
        let handler = LogHandler::new(Arc::new(JsonSink::new(out.clone(), Level::Info)));

        handler
            .handle(&Context::new(), LogRecord::new(Level::Error, "boom"))
            .unwrap();

        assert_eq!(out.json_lines()[0]["level"], "ERROR");
    }

    #[test]
    fn test_with_attrs_keeps_reporter() {
        let (handler, out, reporter) = handler(Level::Debug);
        let derived = handler
            .with_attrs(vec![Attr::new("component", "billing")])
            .with_group("ctx");

        derived
            .handle(
                &Context::new(),
                LogRecord::new(Level::Warn, "retrying").with_attr(Attr::new("attempt", 2i64)),
            )
            .unwrap();

        let line = &out.json_lines()[0];
        assert_eq!(line["component"], "billing");
        assert_eq!(line["ctx"]["attempt"], 2);
        assert_eq!(reporter.events.lock().len(), 1);
    }
}
