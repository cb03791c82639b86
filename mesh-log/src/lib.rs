//! Mesh Logging
//!
//! Structured logging for mesh services. Records are written as JSON lines
//! (or pretty-printed on a developer machine), carry the active trace and
//! span ids, and warnings and errors are escalated to the error reporter.
//!
//! # Features
//!
//! - **Trace correlation**: `trace_id` / `span_id` added whenever a span is
//!   active in the OpenTelemetry context
//! - **Error escalation**: warn+ records become error-reporting events with
//!   attributes, exception chain and stack
//! - **`tracing` bridge**: [`LogLayer`] turns `tracing` events into records
//!
//! # Usage
//!
//! ```rust
//! use mesh_log::{Attr, JsonSink, Level, LogHandler, LogRecord, MemoryWriter};
//! use std::sync::Arc;
//!
//! let out = MemoryWriter::new();
//! let handler = LogHandler::new(Arc::new(JsonSink::new(out.clone(), Level::Info)));
//!
//! let record = LogRecord::new(Level::Info, "order placed").with_attr(Attr::new("id", 7i64));
//! handler.handle(&opentelemetry::Context::new(), record).unwrap();
//!
//! assert_eq!(out.json_lines()[0]["msg"], "order placed");
//! ```
//!
//! # Environment Variables
//!
//! - `MESH_LOG_LEVEL=trace|debug|info|warn|error` - Set log level
//! - `MESH_LOG_FORMAT=json|pretty` - Set output format
//! - `DEBUG=true` - Enable debug logging
//! - `DEPLOYMENT_ENV=local` - Pretty output at debug level
//! - `NO_COLOR` - Disable colors in pretty output

mod error;
mod handler;
mod layer;
mod pretty;
mod record;
mod sink;
mod traced;

pub use error::{LogError, LogResult};
pub use handler::LogHandler;
pub use layer::LogLayer;
pub use pretty::PrettyWriter;
pub use record::{
    Attr, AttrValue, ErrorAttr, ErrorCause, LogRecord, MAX_ERROR_DEPTH, attrs_to_json,
};
pub use sink::{JsonSink, LogSink, MemoryWriter};
pub use traced::{Traced, TracedError, strip_logging_frames};

use mesh_telemetry::{DeploymentEnv, Reporter};
use once_cell::sync::OnceCell;
use std::env;
use std::io;
use std::sync::Arc;

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for mesh logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Get level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    /// Filter directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Indented, coloured output for developer machines
    Pretty,
    /// One JSON object per line
    Json,
}

impl Format {
    /// Get format from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Environment variable overriding the minimum level.
pub const ENV_LOG_LEVEL: &str = "MESH_LOG_LEVEL";
/// Environment variable overriding the output format.
pub const ENV_LOG_FORMAT: &str = "MESH_LOG_FORMAT";
/// Environment variable enabling debug logging.
pub const ENV_DEBUG: &str = "DEBUG";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether the pretty format uses colors
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Json,
            color: false,
        }
    }
}

impl LogConfig {
    /// Configuration for a developer machine: pretty output at debug level.
    pub fn local() -> Self {
        Self {
            level: Level::Debug,
            format: Format::Pretty,
            color: color_supported(),
        }
    }

    /// Create config from environment variables.
    ///
    /// An unknown `DEPLOYMENT_ENV` value is a configuration error.
    pub fn from_env() -> LogResult<Self> {
        let deployment = DeploymentEnv::from_env()?;
        let mut config = match deployment {
            Some(env) if env.is_local() => Self::local(),
            _ => Self::default(),
        };

        let debug = env::var(ENV_DEBUG)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug {
            config.level = Level::Debug;
        }

        if let Ok(value) = env::var(ENV_LOG_LEVEL) {
            config.level = Level::parse(&value).ok_or_else(|| {
                LogError::Config(format!("invalid {ENV_LOG_LEVEL} value {value:?}"))
            })?;
        }

        if let Ok(value) = env::var(ENV_LOG_FORMAT) {
            config.format = Format::parse(&value).ok_or_else(|| {
                LogError::Config(format!("invalid {ENV_LOG_FORMAT} value {value:?}"))
            })?;
            config.color = config.format == Format::Pretty && color_supported();
        }

        Ok(config)
    }

    /// Sink writing to standard output in the configured format.
    pub fn stdout_sink(&self) -> Arc<dyn LogSink> {
        match self.format {
            Format::Json => Arc::new(JsonSink::stdout(self.level)),
            Format::Pretty => Arc::new(JsonSink::new(
                PrettyWriter::new(io::stdout(), self.color),
                self.level,
            )),
        }
    }
}

fn color_supported() -> bool {
    env::var("NO_COLOR").is_err() && env::var("TERM").is_ok()
}

// ============================================================================
// Global Handler
// ============================================================================

static HANDLER: OnceCell<LogHandler> = OnceCell::new();

/// Install `LogLayer` as the global `tracing` subscriber.
///
/// Records below `config.level` are dropped; `RUST_LOG` may narrow this
/// further per target. Warnings and errors are escalated to `reporter` when
/// given. Fails if a global subscriber is already set.
pub fn init_logging(config: &LogConfig, reporter: Option<Arc<dyn Reporter>>) -> LogResult<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let handler = LogHandler::new(config.stdout_sink()).with_optional_reporter(reporter);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(LogLayer::new(handler.clone()))
        .try_init()
        .map_err(|e| LogError::Init(e.to_string()))?;

    // A second successful try_init is impossible, so the cell is still empty.
    let _ = HANDLER.set(handler);
    Ok(())
}

/// Handler installed by [`init_logging`], for callers logging with an
/// explicit OpenTelemetry context.
pub fn handler() -> Option<&'static LogHandler> {
    HANDLER.get()
}

// ============================================================================
// Tests
// ============================================================================
