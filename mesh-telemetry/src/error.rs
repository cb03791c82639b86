//! Error types for telemetry setup and reporting

use std::fmt;

use thiserror::Error;

/// Boxed error returned by teardown callbacks and transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid error-reporting DSN
    #[error("Invalid DSN: {0}")]
    Dsn(String),

    /// Exporter error
    #[error("Exporter error: {0}")]
    Exporter(String),

    /// Error-reporting transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Shutdown error
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// Generic error
    #[error("Telemetry error: {0}")]
    Other(String),
}

impl From<url::ParseError> for TelemetryError {
    fn from(err: url::ParseError) -> Self {
        TelemetryError::Dsn(err.to_string())
    }
}

impl From<reqwest::Error> for TelemetryError {
    fn from(err: reqwest::Error) -> Self {
        TelemetryError::Transport(err.to_string())
    }
}

impl From<String> for TelemetryError {
    fn from(s: String) -> Self {
        TelemetryError::Other(s)
    }
}

impl From<&str> for TelemetryError {
    fn from(s: &str) -> Self {
        TelemetryError::Other(s.to_string())
    }
}

/// Aggregate of every teardown failure seen during a registry flush.
#[derive(Debug, Default)]
pub struct ShutdownError {
    failures: Vec<(String, BoxError)>,
}

impl ShutdownError {
    pub(crate) fn push(&mut self, name: impl Into<String>, error: BoxError) {
        self.failures.push((name.into(), error));
    }

    /// Number of failed teardowns.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true when no teardown failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Iterate over `(entry name, error)` pairs in registration order.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &BoxError)> {
        self.failures.iter().map(|(name, err)| (name.as_str(), err))
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} shutdown step(s) failed", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, "; {name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_error_display() {
        let mut err = ShutdownError::default();
        assert!(err.is_empty());

        err.push("tracer provider", "exporter unreachable".into());
        err.push("error reporting", "queue closed".into());

        assert_eq!(err.len(), 2);
        assert_eq!(
            err.to_string(),
            "2 shutdown step(s) failed; tracer provider: exporter unreachable; error reporting: queue closed"
        );
    }

    #[test]
    fn test_url_error_maps_to_dsn() {
        let err: TelemetryError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, TelemetryError::Dsn(_)));
    }
}
