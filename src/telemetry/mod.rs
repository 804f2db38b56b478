//! Telemetry hooks: structured events at step and request boundaries, with
//! a redaction pass applied to any free-form text before it reaches a log
//! line. The orchestrator calls into hooks synchronously but hooks
//! themselves must never block it — [`ChannelTelemetryHooks`] hands events
//! to a bounded channel and drops them on backpressure rather than stalling
//! the caller.
//!
//! Also carries the process-wide OpenTelemetry wiring (`TelemetryConfig`,
//! `init_telemetry`, `init_otlp_tracer`, `shutdown_telemetry`), independent
//! of the event-hook machinery above.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use std::collections::HashMap;

use tokio::sync::mpsc::{self, Sender};
use uuid::Uuid;

use crate::model::StepName;

/// Keys whose values are stripped from any free-form metadata string before
/// it reaches a log line.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "api_key",
    "secret",
    "auth",
    "credential",
    "ssn",
    "patient_id",
    "medical_record_number",
    "dob",
    "phone",
    "email",
    "address",
];

/// Redacts `key: value` style comma-separated segments whose key matches the
/// sensitive set (case-insensitive), replacing the value with `[REDACTED]`.
/// Intended for the one-line metadata strings telemetry events carry, not
/// arbitrary prose.
pub fn redact(input: &str) -> String {
    input
        .split(',')
        .map(|segment| {
            let lower = segment.to_lowercase();
            if SENSITIVE_KEYS.iter().any(|key| lower.contains(key)) {
                match segment.split_once(':') {
                    Some((k, _)) => format!("{k}:[REDACTED]"),
                    None => "[REDACTED]".to_string(),
                }
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// The taxonomy of boundaries telemetry observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEventKind {
    RequestStart,
    StepStart,
    StepComplete,
    StepFailed,
    StepSkipped,
    RequestComplete,
}

/// A single structured telemetry event.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub request_id: Uuid,
    pub kind: TelemetryEventKind,
    pub step_name: Option<StepName>,
    pub duration_ms: Option<u64>,
    pub config_hash: String,
    pub metadata: HashMap<String, String>,
}

/// Pluggable telemetry sink. The orchestrator calls `emit` synchronously at
/// every transition; implementations must return immediately.
pub trait TelemetryHooks: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// A sink that does nothing, useful for tests that don't care about the
/// telemetry stream.
pub struct NoopTelemetryHooks;

impl TelemetryHooks for NoopTelemetryHooks {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Default production sink: hands events to a bounded channel drained by a
/// background task that applies [`redact`] and logs via `tracing`. `emit`
/// uses `try_send` so a full channel drops the event instead of blocking
/// the orchestrator.
pub struct ChannelTelemetryHooks {
    sender: Sender<TelemetryEvent>,
}

impl ChannelTelemetryHooks {
    pub fn new(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<TelemetryEvent>(capacity);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                log_event(&event);
            }
        });
        Self { sender }
    }
}

impl Default for ChannelTelemetryHooks {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TelemetryHooks for ChannelTelemetryHooks {
    fn emit(&self, event: TelemetryEvent) {
        if self.sender.try_send(event).is_err() {
            tracing::warn!("telemetry channel full, dropping event");
        }
    }
}

fn log_event(event: &TelemetryEvent) {
    let metadata = event
        .metadata
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",");
    let redacted = redact(&metadata);
    tracing::info!(
        request_id = %event.request_id,
        kind = ?event.kind,
        step_name = event.step_name.map(|s| s.to_string()),
        duration_ms = event.duration_ms,
        config_hash = %event.config_hash,
        metadata = %redacted,
        "pipeline event"
    );
}

// ---------------------------------------------------------------------
// OpenTelemetry / tracing-subscriber wiring (ambient observability stack)
// ---------------------------------------------------------------------

/// Process-wide logging/tracing configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "triage-orchestrator".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Reads `OTEL_SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT`, and
    /// `OTEL_TRACES_SAMPLER_ARG`, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }
        config
    }
}

/// Wires a `tracing_subscriber` registry, optionally exporting to an OTLP
/// collector. Returns the `Tracer` when OTLP is configured so the caller
/// can hold onto it for the process lifetime.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());
        let subscriber = tracing_subscriber::registry().with(env_filter).with(telemetry_layer);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "telemetry initialized with OTLP export"
        );
        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);
        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }
        tracing::info!("telemetry initialized (console only, no OTLP)");
        Ok(None)
    }
}

fn init_otlp_tracer(service_name: &str, endpoint: &str, sampling_ratio: f64) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);
    Ok(tracer)
}

pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_strips_sensitive_values() {
        let input = "step:route,patient_id:12345,confidence:0.9";
        let output = redact(input);
        assert!(output.contains("patient_id:[REDACTED]"));
        assert!(output.contains("confidence:0.9"));
        assert!(!output.contains("12345"));
    }

    #[test]
    fn redact_is_case_insensitive() {
        let input = "API_KEY:abc123";
        assert_eq!(redact(input), "API_KEY:[REDACTED]");
    }

    #[test]
    fn config_default_has_no_otlp_endpoint() {
        let config = TelemetryConfig::default();
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
    }

    #[tokio::test]
    async fn channel_hooks_do_not_block_on_full_channel() {
        let hooks = ChannelTelemetryHooks::new(1);
        for _ in 0..10 {
            hooks.emit(TelemetryEvent {
                request_id: Uuid::new_v4(),
                kind: TelemetryEventKind::StepStart,
                step_name: Some(StepName::Validate),
                duration_ms: None,
                config_hash: "abc".to_string(),
                metadata: HashMap::new(),
            });
        }
    }
}
