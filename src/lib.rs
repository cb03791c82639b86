// Mesh - observability plumbing for backend services
//
// This library carries trace context across message-queue boundaries, writes
// trace-aware structured logs that escalate failures to an error reporter,
// and runs traced consumer groups.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

// Re-export member crates
pub use mesh_log as log;
pub use mesh_messaging as messaging;
pub use mesh_telemetry as telemetry;

pub use mesh_log::{LogConfig, init_logging};
pub use mesh_telemetry::{ObservabilityContext, TelemetryBuilder, TelemetryConfig};

use mesh_log::LogError;
use mesh_telemetry::TelemetryError;
use mesh_telemetry::report::Transport;

/// Result type alias for [`init`]
pub type MeshResult<T> = Result<T, MeshError>;

/// Process initialisation errors
#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Everything [`init`] needs besides the service name.
#[derive(Debug, Clone, Default)]
pub struct MeshConfig {
    pub telemetry: TelemetryConfig,
    pub log: LogConfig,
    /// Deliver error reports here instead of the DSN's HTTP endpoint
    pub reporting_transport: Option<Arc<dyn Transport>>,
}

impl MeshConfig {
    /// Read telemetry and logging settings from the environment.
    pub fn from_env(service_name: impl Into<String>) -> MeshResult<Self> {
        Ok(Self {
            telemetry: TelemetryConfig::from_env(service_name)?,
            log: LogConfig::from_env()?,
            reporting_transport: None,
        })
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Route error reports through `transport`. Enables reporting without a DSN.
    pub fn with_reporting_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.reporting_transport = Some(transport);
        self
    }
}

/// Set up tracing, error reporting and logging for the process.
///
/// Builds the telemetry context for `service`, installs it as the
/// OpenTelemetry global and installs the global `tracing` subscriber with
/// warn+ records escalated to the error reporter. Call
/// [`ObservabilityContext::flush`] on the result before exiting.
///
/// Fails if a global subscriber is already installed; the telemetry built so
/// far is flushed first.
pub async fn init(
    service: impl Into<String>,
    config: MeshConfig,
) -> MeshResult<Arc<ObservabilityContext>> {
    let MeshConfig {
        mut telemetry,
        log,
        reporting_transport,
    } = config;
    telemetry.service_name = service.into();

    let mut builder = TelemetryBuilder::from_config(telemetry);
    if let Some(transport) = reporting_transport {
        builder = builder.with_reporting_transport(transport);
    }
    let obs = builder.build().await?;

    if let Err(err) = init_logging(&log, obs.reporter()) {
        if let Err(flush_err) = obs.flush().await {
            warn!(error = %flush_err, "Telemetry flush failed");
        }
        return Err(err.into());
    }

    info!(service = %obs.service_name(), "Observability initialized");
    Ok(Arc::new(obs))
}

// Prelude for common imports
pub mod prelude {
    pub use crate::{MeshConfig, MeshError, MeshResult, init};
    pub use mesh_log::{Level, LogConfig};
    pub use mesh_messaging::{
        Consumer, ConsumerMessage, HandlerError, MessageHandler, Producer, ProducerMessage,
        TracedProducer, handler_fn,
    };
    pub use mesh_telemetry::{
        Context, DeploymentEnv, ObservabilityContext, TelemetryBuilder, TelemetryConfig,
    };
}
