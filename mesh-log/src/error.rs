//! Logging errors

use mesh_telemetry::TelemetryError;
use thiserror::Error;

/// Result type alias for logging operations
pub type LogResult<T> = Result<T, LogError>;

/// Logging error types
#[derive(Debug, Error)]
pub enum LogError {
    /// Writing a record failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid logging configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A global subscriber was already installed
    #[error("Initialization error: {0}")]
    Init(String),

    /// Error from the telemetry layer
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}
