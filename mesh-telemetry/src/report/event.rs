//! Event payloads submitted to the error-reporting backend

use chrono::{DateTime, Utc};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry_sdk::trace::SpanData;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::dsn::Dsn;

/// Marker that tells the backend to keep its default grouping.
pub const DEFAULT_FINGERPRINT: &str = "{{ default }}";

/// Severity of a reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    /// Warning-level log record
    Warning,
    /// Error-level log record
    Error,
}

/// One stack frame of a captured exception.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Function name, demangled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    /// Module path the function lives in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Source file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Line number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
}

/// Frames of an exception, caller first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stacktrace {
    pub frames: Vec<StackFrame>,
}

/// A single exception value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedException {
    /// Error type name
    #[serde(rename = "type")]
    pub ty: String,

    /// Rendered error message
    pub value: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Stacktrace>,
}

/// Trace correlation attached under `contexts.trace`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCorrelation {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Event contexts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contexts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceCorrelation>,
}

impl Contexts {
    fn is_empty(&self) -> bool {
        self.trace.is_none()
    }
}

/// An error event built from a warning or error log record.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: ReportLevel,
    pub message: String,
    pub platform: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,

    /// Structured attributes of the originating record
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,

    /// Error and its sources, outermost first
    #[serde(
        rename = "exception",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_values"
    )]
    pub exceptions: Vec<CapturedException>,

    #[serde(skip_serializing_if = "Contexts::is_empty")]
    pub contexts: Contexts,

    pub fingerprint: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[allow(clippy::ptr_arg)]
fn serialize_values<S: Serializer>(
    values: &Vec<CapturedException>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Values<'a> {
        values: &'a [CapturedException],
    }

    Values { values }.serialize(serializer)
}

impl ReportEvent {
    /// New event grouped by the default fingerprint plus the message.
    pub fn new(level: ReportLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            level,
            fingerprint: vec![DEFAULT_FINGERPRINT.to_string(), message.clone()],
            message,
            platform: "other",
            logger: None,
            extra: Map::new(),
            exceptions: Vec::new(),
            contexts: Contexts::default(),
            release: None,
            environment: None,
            tags: BTreeMap::new(),
        }
    }

    /// Override the event timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the logger name
    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Add an extra attribute
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Append an exception value
    pub fn with_exception(mut self, exception: CapturedException) -> Self {
        self.exceptions.push(exception);
        self
    }

    /// Correlate the event with a trace
    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.contexts.trace = Some(TraceCorrelation {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            ..Default::default()
        });
        self
    }
}

/// A finished span, as nested in a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub op: String,
    pub description: String,
    pub start_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl From<&SpanData> for SpanRecord {
    fn from(span: &SpanData) -> Self {
        let parent = span.parent_span_id;
        let data = span
            .attributes
            .iter()
            .map(|kv| (kv.key.as_str().to_string(), Value::String(kv.value.to_string())))
            .collect();

        Self {
            trace_id: span.span_context.trace_id().to_string(),
            span_id: span.span_context.span_id().to_string(),
            parent_span_id: (parent != opentelemetry::trace::SpanId::INVALID)
                .then(|| parent.to_string()),
            op: span_op(&span.span_kind).to_string(),
            description: span.name.to_string(),
            start_timestamp: DateTime::<Utc>::from(span.start_time),
            timestamp: DateTime::<Utc>::from(span.end_time),
            status: span_status(&span.status).to_string(),
            data,
        }
    }
}

fn span_op(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "queue.publish",
        SpanKind::Consumer => "queue.process",
        _ => "internal",
    }
}

fn span_status(status: &Status) -> &'static str {
    match status {
        Status::Error { .. } => "internal_error",
        _ => "ok",
    }
}

/// A locally rooted span tree.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub ty: &'static str,
    pub transaction: String,
    pub start_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub platform: &'static str,
    pub contexts: Contexts,
    pub spans: Vec<SpanRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl TransactionEvent {
    /// Build a transaction from its root span and the spans that finished
    /// under it.
    pub fn from_root(root: &SpanData, spans: Vec<SpanRecord>) -> Self {
        let record = SpanRecord::from(root);
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            ty: "transaction",
            transaction: record.description.clone(),
            start_timestamp: record.start_timestamp,
            timestamp: record.timestamp,
            platform: "other",
            contexts: Contexts {
                trace: Some(TraceCorrelation {
                    trace_id: record.trace_id,
                    span_id: record.span_id,
                    parent_span_id: record.parent_span_id,
                    op: Some(record.op),
                    status: Some(record.status),
                }),
            },
            spans,
            release: None,
            environment: None,
            tags: BTreeMap::new(),
        }
    }
}

/// Anything the client can submit.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Event(ReportEvent),
    Transaction(TransactionEvent),
}

impl Envelope {
    pub fn event_id(&self) -> &str {
        match self {
            Envelope::Event(event) => &event.event_id,
            Envelope::Transaction(tx) => &tx.event_id,
        }
    }

    fn item_type(&self) -> &'static str {
        match self {
            Envelope::Event(_) => "event",
            Envelope::Transaction(_) => "transaction",
        }
    }

    /// Newline-delimited wire form: envelope header, item header, payload.
    pub fn to_bytes(&self, dsn: &Dsn) -> serde_json::Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let header = serde_json::json!({
            "event_id": self.event_id(),
            "dsn": dsn.to_string(),
            "sent_at": Utc::now(),
        });
        let item = serde_json::json!({
            "type": self.item_type(),
            "length": payload.len(),
        });

        let mut out = serde_json::to_vec(&header)?;
        out.push(b'\n');
        serde_json::to_writer(&mut out, &item)?;
        out.push(b'\n');
        out.extend_from_slice(&payload);
        out.push(b'\n');
        Ok(out)
    }
}
