//! Trace propagation, tracer setup and error reporting for mesh services
//!
//! This crate provides the observability core shared by the logging and
//! messaging crates:
//! - Trace-context propagation through flat string carriers
//! - Tracer provider setup with an always-on sampler
//! - An ordered shutdown registry flushed once at process exit
//! - An asynchronous error-reporting client fed by log records and spans
//!
//! # Examples
//!
//! ## Telemetry Configuration
//!
//! ```
//! use mesh_telemetry::{DeploymentEnv, TelemetryConfig};
//!
//! let config = TelemetryConfig::new("orders")
//!     .with_release("1.4.0")
//!     .with_environment(DeploymentEnv::Staging);
//!
//! assert_eq!(config.service_name, "orders");
//! assert!(config.environment.unwrap().is_production());
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Propagating a Trace Across a Message Boundary
//!
//! ```
//! use mesh_telemetry::{TelemetryBuilder, HeaderCarrier};
//! use opentelemetry::Context;
//! use opentelemetry::trace::{TraceContextExt, Tracer};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let obs = TelemetryBuilder::new("orders")
//!     .install_global(false)
//!     .build()
//!     .await
//!     .unwrap();
//!
//! let span = obs.tracer().start("publish");
//! let cx = Context::new().with_span(span);
//!
//! let mut headers = HeaderCarrier::new();
//! obs.inject(&cx, &mut headers);
//!
//! let remote = obs.extract(&headers);
//! assert_eq!(
//!     remote.span().span_context().trace_id(),
//!     cx.span().span_context().trace_id(),
//! );
//!
//! obs.flush().await.unwrap();
//! # }
//! ```

pub mod builder;
pub mod carrier;
pub mod config;
pub mod error;
pub mod propagation;
pub mod report;
pub mod shutdown;
mod tracer;

pub use builder::{ObservabilityContext, TelemetryBuilder};
pub use carrier::{HeaderCarrier, extract_context, extract_context_with, inject_context};
pub use config::*;
pub use error::{BoxError, ShutdownError, TelemetryError, TelemetryResult};
pub use propagation::{SENTRY_TRACE_HEADER, SentryPropagator, build_propagator};
pub use report::{Reporter, ReportingClient};
pub use shutdown::{ShutdownEntry, ShutdownFn, ShutdownRegistry};

// Re-export commonly used OpenTelemetry types
pub use opentelemetry::{
    Context, KeyValue,
    trace::{SpanKind, Status, TraceContextExt},
};
