//! Tracer provider setup

use crate::{
    config::TelemetryConfig,
    error::{TelemetryError, TelemetryResult},
    report::{Reporter, ReportingSpanProcessor},
    shutdown::ShutdownRegistry,
};
use opentelemetry_sdk::trace::{
    RandomIdGenerator, Sampler, SdkTracerProvider, SpanExporter, TracerProviderBuilder,
};
use std::sync::Arc;

/// Deferred step adding an exporter to the provider builder.
pub(crate) type ExporterHook = Box<dyn FnOnce(TracerProviderBuilder) -> TracerProviderBuilder + Send>;

/// Wrap a span exporter so it is attached with a simple (synchronous) processor.
pub(crate) fn simple_exporter<E>(exporter: E) -> ExporterHook
where
    E: SpanExporter + 'static,
{
    Box::new(move |builder| builder.with_simple_exporter(exporter))
}

/// Build the tracer provider for `config`.
///
/// Sampling is always on. With the `otlp` feature a configured endpoint gets a
/// batch exporter; `reporter` adds the span processor forwarding transactions.
pub(crate) fn build_provider(
    config: &TelemetryConfig,
    exporters: Vec<ExporterHook>,
    reporter: Option<Arc<dyn Reporter>>,
) -> TelemetryResult<SdkTracerProvider> {
    let mut builder = SdkTracerProvider::builder()
        .with_resource(config.create_resource())
        .with_id_generator(RandomIdGenerator::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_max_attributes_per_span(config.max_attributes_per_span)
        .with_max_events_per_span(config.max_events_per_span);

    #[cfg(feature = "otlp")]
    if let Some(ref endpoint) = config.otlp_endpoint {
        use opentelemetry_otlp::WithExportConfig;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

        builder = builder.with_batch_exporter(exporter);
    }

    #[cfg(not(feature = "otlp"))]
    if config.otlp_endpoint.is_some() {
        tracing::warn!("OTLP endpoint configured but the otlp feature is disabled");
    }

    for hook in exporters {
        builder = hook(builder);
    }

    if let Some(reporter) = reporter {
        builder = builder.with_span_processor(ReportingSpanProcessor::new(reporter));
    }

    Ok(builder.build())
}

/// Provider with no exporter: spans are created and dropped.
pub(crate) fn noop_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_sampler(Sampler::AlwaysOn)
        .build()
}

/// Register the provider's own teardown.
///
/// Shutdown flushes batch exporters and blocks, so it runs off the async
/// worker threads.
pub(crate) fn register_shutdown(registry: &ShutdownRegistry, provider: SdkTracerProvider) {
    registry.register("tracer provider", move |_cancel| async move {
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| TelemetryError::Other(e.to_string()))?
            .map_err(|e| TelemetryError::Exporter(e.to_string()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Tracer, TracerProvider as _};
    use opentelemetry_sdk::trace::InMemorySpanExporter;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_build_provider_with_exporter() {
        let exporter = InMemorySpanExporter::default();
        let config = TelemetryConfig::new("test-service").with_release("2.0.0");

        let provider =
            build_provider(&config, vec![simple_exporter(exporter.clone())], None).unwrap();
        provider.tracer("test").in_span("work", |_cx| {});

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "work");
    }

    #[tokio::test]
    async fn test_registered_shutdown_flushes_provider() {
        let exporter = InMemorySpanExporter::default();
        let provider = build_provider(
            &TelemetryConfig::new("test-service"),
            vec![simple_exporter(exporter.clone())],
            None,
        )
        .unwrap();

        let registry = ShutdownRegistry::new();
        register_shutdown(&registry, provider.clone());
        assert_eq!(registry.names(), vec!["tracer provider"]);

        registry.flush(CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn test_noop_provider_creates_spans() {
        let provider = noop_provider();
        provider.tracer("test").in_span("noop", |_cx| {});
    }
}
