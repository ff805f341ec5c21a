use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::ServerConfig;

const SERVICE_NAME: &str = "edge-server";

/// `RUST_LOG` wins, INFO otherwise.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

fn log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if !config.structured_logging() {
        return Box::new(tracing_subscriber::fmt::layer().compact());
    }
    // Request spans carry the edge id, keep them on every line.
    Box::new(
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true),
    )
}

fn span_provider(config: &ServerConfig) -> Result<SdkTracerProvider> {
    let mut exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.clone());
    }
    let resource = Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("deployment.environment", config.env.clone()))
        .with_attribute(KeyValue::new("edge.instance.id", config.instance_id()))
        .build();
    Ok(TracerProviderBuilder::default()
        .with_resource(resource)
        .with_batch_exporter(exporter.build()?)
        .build())
}

fn install<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
}

/// Installs the global subscriber. The returned provider has to be flushed
/// and shut down before exit when span export is enabled.
pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let subscriber = Registry::default().with(log_layer(config).with_filter(log_filter()));
    if !config.telemetry.enable_tracing {
        install(subscriber);
        return Ok(None);
    }

    let provider = span_provider(config)?;
    global::set_tracer_provider(provider.clone());
    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(provider.tracer(SERVICE_NAME))
        .with_filter(log_filter());
    install(subscriber.with(otel_layer));
    Ok(Some(provider))
}
