//! Logging and OpenTelemetry setup for the tunnel binaries
//!
//! Logs go to stdout as JSON by default (`REMOTEDIALER_LOG_FORMAT=text` for
//! humans) filtered by `RUST_LOG`. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set,
//! spans and the tunnel counters are exported over OTLP, tagged with the
//! process's tunnel identity (agent client id or server peer id).

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::env_or;

const DEFAULT_FILTER: &str = "info,remotedialer=debug,tungstenite=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP span or metric exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {reason}")]
    Exporter {
        /// "span" or "metric"
        signal: &'static str,
        /// Exporter error text
        reason: String,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log line encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable lines
    Text,
}

impl LogFormat {
    fn from_env() -> Self {
        match env_or("REMOTEDIALER_LOG_FORMAT", String::new()).as_str() {
            "text" | "pretty" => Self::Text,
            _ => Self::Json,
        }
    }
}

/// What to call this process in logs and exported telemetry
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `remotedialer-server` or `remotedialer-agent`
    pub service_name: String,

    /// Tunnel identity, exported as `service.instance.id`
    pub instance_id: Option<String>,

    /// OTLP collector endpoint; logs only when unset
    pub otlp_endpoint: Option<String>,

    /// Log line encoding
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "remotedialer".to_string(),
            instance_id: None,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_format: LogFormat::from_env(),
        }
    }
}

/// Install the global subscriber, plus OTLP exporters when configured
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = tunnel_resource(&config);
            global::set_meter_provider(meter_provider(endpoint, resource.clone())?);
            let provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (json, text) = match config.log_format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().compact())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(text)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

fn tunnel_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Some(id) = &config.instance_id {
        attributes.push(KeyValue::new("service.instance.id", id.clone()));
    }
    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "span",
            reason: e.to_string(),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metric",
            reason: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}
