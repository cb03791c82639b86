//! Error reporting
//!
//! Warning and error log records are escalated to an external error-reporting
//! backend as events; locally rooted span trees are forwarded as transactions.
//! The wire format is the backend's JSON store protocol, addressed by a DSN.

mod client;
mod dsn;
mod event;
mod span_processor;
mod transport;

pub use client::{Reporter, ReportingClient, ReportingOptions};
pub use dsn::Dsn;
pub use event::{
    CapturedException, Contexts, DEFAULT_FINGERPRINT, Envelope, ReportEvent, ReportLevel,
    SpanRecord, StackFrame, Stacktrace, TraceCorrelation, TransactionEvent,
};
pub use span_processor::ReportingSpanProcessor;
pub use transport::{HttpTransport, MemoryTransport, Transport};
