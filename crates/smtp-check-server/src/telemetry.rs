//! OpenTelemetry integration for distributed tracing
//!
//! Spans and events from every `tracing` macro in the server and the check
//! engine are exported over OTLP when telemetry is enabled.

use crate::config::{LoggingSettings, OtlpProtocol, TelemetrySettings};
use common::Error;
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const TRACER_NAME: &str = "smtp-check-server";

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Build the OTLP tracer provider and install it globally.
///
/// Returns `None` when telemetry is disabled.
pub fn init_telemetry(settings: &TelemetrySettings) -> common::Result<Option<TracerProvider>> {
    if !settings.enabled {
        return Ok(None);
    }

    let exporter = match settings.protocol {
        OtlpProtocol::Grpc => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(settings.otlp_endpoint.as_str())
            .build(),
        OtlpProtocol::Http => SpanExporter::builder()
            .with_http()
            .with_endpoint(settings.otlp_endpoint.as_str())
            .build(),
    }
    .map_err(|e| Error::other(format!("failed to build OTLP exporter: {}", e)))?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());

    Ok(Some(provider))
}

/// Setup tracing-subscriber, with an OpenTelemetry layer when enabled.
///
/// `RUST_LOG` overrides the configured level.
pub fn setup_tracing_with_otel(
    telemetry: &TelemetrySettings,
    logging: &LoggingSettings,
) -> common::Result<Option<TelemetryGuard>> {
    let level = logging.level.as_deref().unwrap_or("info");

    let Some(provider) = init_telemetry(telemetry)? else {
        if logging.is_json() {
            common::logging::init_json(level);
        } else {
            common::logging::init_with_level(level);
        }
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    };

    build_subscriber(&provider, level, logging.is_json())
        .try_init()
        .map_err(|e| Error::other(format!("failed to install tracing subscriber: {}", e)))?;

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        "Tracing initialized with OpenTelemetry integration"
    );

    Ok(Some(TelemetryGuard))
}

/// Subscriber stack: env filter, fmt output and the OpenTelemetry layer.
fn build_subscriber(
    provider: &TracerProvider,
    level: &str,
    json: bool,
) -> Box<dyn Subscriber + Send + Sync> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // The otel layer is typed by the stack below it, so each branch builds its own
    if json {
        Box::new(
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .with(tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME))),
        )
    } else {
        Box::new(
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME))),
        )
    }
}
