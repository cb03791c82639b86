//! Configuration for telemetry setup

use crate::error::{TelemetryError, TelemetryResult};
use crate::report::Dsn;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable holding the error-reporting DSN.
pub const ENV_REPORTING_DSN: &str = "SENTRY_DSN";
/// Environment variable holding the service release identifier.
pub const ENV_RELEASE: &str = "SERVICE_RELEASE";
/// Environment variable naming the deployment environment.
pub const ENV_DEPLOYMENT: &str = "DEPLOYMENT_ENV";
/// Environment variable holding the OTLP collector endpoint.
pub const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Deployment environment a service runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnv {
    /// A developer machine
    Local,
    /// Shared development cluster
    Dev,
    /// System integration testing
    Sit,
    /// User acceptance testing
    Uat,
    /// Pre-production
    Staging,
    /// Production
    Prod,
}

impl DeploymentEnv {
    /// All accepted values, in promotion order.
    pub const ALL: [DeploymentEnv; 6] = [
        DeploymentEnv::Local,
        DeploymentEnv::Dev,
        DeploymentEnv::Sit,
        DeploymentEnv::Uat,
        DeploymentEnv::Staging,
        DeploymentEnv::Prod,
    ];

    /// Lowercase name as used in `DEPLOYMENT_ENV`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentEnv::Local => "local",
            DeploymentEnv::Dev => "dev",
            DeploymentEnv::Sit => "sit",
            DeploymentEnv::Uat => "uat",
            DeploymentEnv::Staging => "staging",
            DeploymentEnv::Prod => "prod",
        }
    }

    /// Staging and production count as production.
    pub fn is_production(&self) -> bool {
        matches!(self, DeploymentEnv::Staging | DeploymentEnv::Prod)
    }

    /// Running on a developer machine.
    pub fn is_local(&self) -> bool {
        matches!(self, DeploymentEnv::Local)
    }

    /// Read `DEPLOYMENT_ENV`. Unset yields `None`, an unknown value is an error.
    pub fn from_env() -> TelemetryResult<Option<Self>> {
        match env::var(ENV_DEPLOYMENT) {
            Ok(value) if !value.is_empty() => value.parse().map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentEnv {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentEnv::ALL
            .into_iter()
            .find(|env| env.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = DeploymentEnv::ALL.iter().map(|e| e.as_str()).collect();
                TelemetryError::Config(format!(
                    "invalid {ENV_DEPLOYMENT} value {s:?}, expected one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name
    pub service_name: String,

    /// Release identifier, reported as `service.version`
    pub release: Option<String>,

    /// Deployment environment
    pub environment: Option<DeploymentEnv>,

    /// Error-reporting DSN. Reporting is disabled when unset.
    pub reporting_dsn: Option<String>,

    /// OTLP collector endpoint (only used with the `otlp` feature)
    pub otlp_endpoint: Option<String>,

    /// Maximum attributes per span
    pub max_attributes_per_span: u32,

    /// Maximum events per span
    pub max_events_per_span: u32,

    /// Capacity of the error-reporting submission queue
    pub reporting_queue_capacity: usize,

    /// Budget given to the error-reporting client when flushing at shutdown
    pub reporting_flush_timeout_secs: u64,

    /// Additional resource attributes
    pub resource_attributes: Vec<(String, String)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "mesh-service".to_string(),
            release: None,
            environment: None,
            reporting_dsn: None,
            otlp_endpoint: None,
            max_attributes_per_span: 128,
            max_events_per_span: 128,
            reporting_queue_capacity: 256,
            reporting_flush_timeout_secs: 3,
            resource_attributes: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    /// Create a new configuration with a service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from `SENTRY_DSN`, `SERVICE_RELEASE`,
    /// `DEPLOYMENT_ENV` and `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env(service_name: impl Into<String>) -> TelemetryResult<Self> {
        let non_empty = |key: &str| env::var(key).ok().filter(|v| !v.is_empty());

        let config = Self {
            service_name: service_name.into(),
            release: non_empty(ENV_RELEASE),
            environment: DeploymentEnv::from_env()?,
            reporting_dsn: non_empty(ENV_REPORTING_DSN),
            otlp_endpoint: non_empty(ENV_OTLP_ENDPOINT),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set release
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    /// Set environment
    pub fn with_environment(mut self, env: DeploymentEnv) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set error-reporting DSN
    pub fn with_reporting_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.reporting_dsn = Some(dsn.into());
        self
    }

    /// Set OTLP endpoint
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Add a resource attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.push((key.into(), value.into()));
        self
    }

    /// Flush budget for the error-reporting client.
    pub fn reporting_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.reporting_flush_timeout_secs)
    }

    /// Parsed DSN, if one is configured.
    pub fn dsn(&self) -> TelemetryResult<Option<Dsn>> {
        self.reporting_dsn.as_deref().map(Dsn::parse).transpose()
    }

    /// Create OpenTelemetry resource from configuration
    pub fn create_resource(&self) -> Resource {
        let mut attributes = Vec::new();

        if let Some(ref release) = self.release {
            attributes.push(KeyValue::new(SERVICE_VERSION, release.clone()));
        }

        if let Some(env) = self.environment {
            attributes.push(KeyValue::new("deployment.environment.name", env.as_str()));
        }

        for (key, value) in &self.resource_attributes {
            attributes.push(KeyValue::new(key.clone(), value.clone()));
        }

        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(attributes)
            .build()
    }

    /// Validate configuration
    pub fn validate(&self) -> TelemetryResult<()> {
        if self.service_name.is_empty() {
            return Err(TelemetryError::Config(
                "Service name cannot be empty".to_string(),
            ));
        }

        self.dsn()?;

        if let Some(ref endpoint) = self.otlp_endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                TelemetryError::Config(format!("invalid OTLP endpoint {endpoint:?}: {e}"))
            })?;
        }

        if self.reporting_queue_capacity == 0 {
            return Err(TelemetryError::Config(
                "Reporting queue capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
