//! Telemetry builder and the resulting observability context

use crate::{
    carrier,
    config::{DeploymentEnv, TelemetryConfig},
    error::{ShutdownError, TelemetryError, TelemetryResult},
    propagation::build_propagator,
    report::{Reporter, ReportingClient, ReportingOptions, Transport},
    shutdown::ShutdownRegistry,
    tracer::{self, ExporterHook},
};
use opentelemetry::{
    Context, global,
    propagation::{Extractor, Injector, TextMapCompositePropagator},
    trace::TracerProvider as _,
};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider, SpanExporter};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a service needs to create, propagate and flush telemetry.
///
/// Built once per process by [`TelemetryBuilder::build`] and shared as an
/// `Arc` with the components that create spans.
pub struct ObservabilityContext {
    service_name: String,
    environment: Option<DeploymentEnv>,
    provider: SdkTracerProvider,
    tracer: SdkTracer,
    propagator: TextMapCompositePropagator,
    reporting: Option<Arc<ReportingClient>>,
    registry: ShutdownRegistry,
}

impl ObservabilityContext {
    /// Context with a no-exporter tracer, no reporting and an empty registry.
    ///
    /// Nothing is installed globally.
    pub fn disabled() -> Self {
        let provider = tracer::noop_provider();
        Self {
            service_name: String::new(),
            environment: None,
            tracer: provider.tracer("mesh"),
            provider,
            propagator: build_propagator(false),
            reporting: None,
            registry: ShutdownRegistry::new(),
        }
    }

    /// Service name the resource was built with
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Deployment environment, if known
    pub fn environment(&self) -> Option<DeploymentEnv> {
        self.environment
    }

    /// Tracer for spans created by this service
    pub fn tracer(&self) -> &SdkTracer {
        &self.tracer
    }

    /// Underlying tracer provider
    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    /// Configured propagator chain
    pub fn propagator(&self) -> &TextMapCompositePropagator {
        &self.propagator
    }

    /// Error reporter, when a DSN was configured
    pub fn reporter(&self) -> Option<Arc<dyn Reporter>> {
        self.reporting
            .as_ref()
            .map(|client| client.clone() as Arc<dyn Reporter>)
    }

    /// Concrete reporting client, when a DSN was configured
    pub fn reporting_client(&self) -> Option<&Arc<ReportingClient>> {
        self.reporting.as_ref()
    }

    /// Registry holding teardown steps. Other subsystems may add their own.
    pub fn registry(&self) -> &ShutdownRegistry {
        &self.registry
    }

    /// Serialize `cx` into `carrier`.
    pub fn inject(&self, cx: &Context, carrier: &mut dyn Injector) {
        carrier::inject_context(&self.propagator, cx, carrier);
    }

    /// Read a context from `carrier`. Never fails: missing or malformed keys
    /// yield a context with no parent span.
    pub fn extract(&self, carrier: &dyn Extractor) -> Context {
        carrier::extract_context(&self.propagator, carrier)
    }

    /// Read a context from `carrier`, deriving it from `parent`.
    pub fn extract_with(&self, parent: &Context, carrier: &dyn Extractor) -> Context {
        carrier::extract_context_with(&self.propagator, parent, carrier)
    }

    /// Flush every registered subsystem in registration order.
    pub async fn flush(&self) -> Result<(), ShutdownError> {
        self.flush_with(CancellationToken::new()).await
    }

    /// Like [`flush`](Self::flush), passing `cancel` to each teardown.
    pub async fn flush_with(&self, cancel: CancellationToken) -> Result<(), ShutdownError> {
        self.registry.flush(cancel).await
    }
}

impl Default for ObservabilityContext {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for ObservabilityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservabilityContext")
            .field("service_name", &self.service_name)
            .field("environment", &self.environment)
            .field("reporting", &self.reporting.is_some())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for telemetry setup
pub struct TelemetryBuilder {
    config: TelemetryConfig,
    exporters: Vec<ExporterHook>,
    transport: Option<Arc<dyn Transport>>,
    install_global: bool,
}

impl TelemetryBuilder {
    /// Create a new telemetry builder
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::from_config(TelemetryConfig::new(service_name))
    }

    /// Start from an existing configuration
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            exporters: Vec::new(),
            transport: None,
            install_global: true,
        }
    }

    /// Set release, reported as `service.version`
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.config = self.config.with_release(release);
        self
    }

    /// Set deployment environment
    pub fn with_environment(mut self, env: DeploymentEnv) -> Self {
        self.config = self.config.with_environment(env);
        self
    }

    /// Enable error reporting to `dsn`
    pub fn with_reporting_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.config = self.config.with_reporting_dsn(dsn);
        self
    }

    /// Set OTLP endpoint
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config = self.config.with_otlp_endpoint(endpoint);
        self
    }

    /// Add a resource attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config = self.config.with_attribute(key, value);
        self
    }

    /// Export finished spans to `exporter` as soon as they end.
    pub fn with_span_exporter<E>(mut self, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        self.exporters.push(tracer::simple_exporter(exporter));
        self
    }

    /// Deliver error reports through `transport`.
    ///
    /// Enables error reporting even without a DSN.
    pub fn with_reporting_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Whether to install the provider and propagator as OpenTelemetry
    /// globals (default: true).
    pub fn install_global(mut self, install: bool) -> Self {
        self.install_global = install;
        self
    }

    /// Build the context. Must be called inside a Tokio runtime.
    pub async fn build(self) -> TelemetryResult<ObservabilityContext> {
        self.config.validate()?;
        let config = self.config;

        let options = ReportingOptions {
            service: config.service_name.clone(),
            release: config.release.clone(),
            environment: config.environment.map(|e| e.as_str().to_string()),
            queue_capacity: config.reporting_queue_capacity,
        };
        let reporting = match (self.transport, config.dsn()?) {
            (Some(transport), _) => Some(Arc::new(ReportingClient::new(options, transport))),
            (None, Some(dsn)) => Some(Arc::new(ReportingClient::from_dsn(&dsn, options)?)),
            (None, None) => None,
        };

        let provider = tracer::build_provider(
            &config,
            self.exporters,
            reporting
                .as_ref()
                .map(|client| client.clone() as Arc<dyn Reporter>),
        )?;
        let tracer = provider.tracer(config.service_name.clone());
        let with_reporting = reporting.is_some();

        let registry = ShutdownRegistry::new();
        tracer::register_shutdown(&registry, provider.clone());

        if let Some(ref client) = reporting {
            let client = client.clone();
            let budget = config.reporting_flush_timeout();
            registry.register("error reporting", move |_cancel| async move {
                if client.flush(budget).await {
                    Ok(())
                } else {
                    Err(TelemetryError::Transport(format!(
                        "error reports not delivered within {budget:?}"
                    )))
                }
            });
        }

        if self.install_global {
            global::set_tracer_provider(provider.clone());
            global::set_text_map_propagator(build_propagator(with_reporting));
        }

        info!(
            service = %config.service_name,
            release = config.release.as_deref().unwrap_or(""),
            reporting = with_reporting,
            "Telemetry initialized"
        );

        Ok(ObservabilityContext {
            service_name: config.service_name,
            environment: config.environment,
            provider,
            tracer,
            propagator: build_propagator(with_reporting),
            reporting,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::HeaderCarrier;
    use crate::report::{MemoryTransport, ReportEvent, ReportLevel};
    use opentelemetry::trace::{TraceContextExt, Tracer};
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    #[tokio::test]
    async fn test_builder() {
        let obs = TelemetryBuilder::new("test-service")
            .with_release("1.0.0")
            .with_environment(DeploymentEnv::Dev)
            .install_global(false)
            .build()
            .await
            .unwrap();

        assert_eq!(obs.service_name(), "test-service");
        assert!(obs.reporter().is_none());
        assert_eq!(obs.registry().names(), vec!["tracer provider"]);
    }

    #[tokio::test]
    async fn test_builder_rejects_malformed_dsn() {
        let result = TelemetryBuilder::new("test-service")
            .with_reporting_dsn("definitely not a dsn")
            .install_global(false)
            .build()
            .await;

        assert!(matches!(result, Err(TelemetryError::Dsn(_))));
    }

    #[tokio::test]
    async fn test_reporting_registers_after_provider() {
        let obs = TelemetryBuilder::new("test-service")
            .with_reporting_dsn("https://key@reports.example.com/1")
            .install_global(false)
            .build()
            .await
            .unwrap();

        assert!(obs.reporter().is_some());
        assert_eq!(
            obs.registry().names(),
            vec!["tracer provider", "error reporting"]
        );

        let mut carrier = HeaderCarrier::new();
        let span = obs.tracer().start("outgoing");
        let cx = Context::new().with_span(span);
        obs.inject(&cx, &mut carrier);
        assert!(carrier.contains_key("traceparent"));
        assert!(carrier.contains_key("sentry-trace"));
    }

    #[tokio::test]
    async fn test_inject_extract_through_context() {
        let obs = TelemetryBuilder::new("test-service")
            .install_global(false)
            .build()
            .await
            .unwrap();

        let span = obs.tracer().start("outgoing");
        let cx = Context::new().with_span(span);
        let mut carrier = HeaderCarrier::new();
        obs.inject(&cx, &mut carrier);

        let extracted = obs.extract(&carrier);
        assert_eq!(
            extracted.span().span_context().trace_id(),
            cx.span().span_context().trace_id()
        );
        assert!(!carrier.contains_key("sentry-trace"));
    }

    #[tokio::test]
    async fn test_flush_exports_and_drains() {
        let exporter = InMemorySpanExporter::default();
        let transport = Arc::new(MemoryTransport::new());
        let obs = TelemetryBuilder::new("test-service")
            .with_span_exporter(exporter.clone())
            .with_reporting_transport(transport.clone())
            .install_global(false)
            .build()
            .await
            .unwrap();

        obs.tracer().in_span("unit of work", |_cx| {});
        if let Some(reporter) = obs.reporter() {
            reporter.capture_event(ReportEvent::new(ReportLevel::Error, "failure"));
        }

        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);

        obs.flush().await.unwrap();

        assert_eq!(transport.events().len(), 1);
        assert_eq!(transport.transactions().len(), 1);
        assert!(obs.registry().is_empty());

        // second flush has nothing left to run
        obs.flush().await.unwrap();
    }

    #[test]
    fn test_disabled_context() {
        let obs = ObservabilityContext::default();

        obs.tracer().in_span("before init", |_cx| {});
        assert!(obs.reporter().is_none());
        assert!(obs.registry().is_empty());
    }
}
