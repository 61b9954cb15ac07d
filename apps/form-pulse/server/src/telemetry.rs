//! Process-wide tracing subscriber and Prometheus recorder.
//!
//! Logs go to stdout through `tracing_subscriber::fmt`, filtered by
//! `RUST_LOG` (or `FORM_PULSE_LOG`). Setting `FORM_PULSE_OTEL_STDOUT=1` also
//! exports spans through the OpenTelemetry stdout exporter.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "form-pulse";
const LOG_ENV: &str = "FORM_PULSE_LOG";
const OTEL_STDOUT_ENV: &str = "FORM_PULSE_OTEL_STDOUT";
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    pub otel_stdout: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `RUST_LOG` wins over `FORM_PULSE_LOG` so the usual override still works.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup(EnvFilter::DEFAULT_ENV)
            .or_else(|| lookup(LOG_ENV))
            .filter(|directives| !directives.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        Self {
            filter,
            otel_stdout: lookup(OTEL_STDOUT_ENV).is_some_and(|value| is_truthy(&value)),
        }
    }
}

/// Keep alive for the lifetime of the server so spans are flushed on drop.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        Self::init_with(TelemetryConfig::from_env())
    }

    pub fn init_with(config: TelemetryConfig) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let filter = EnvFilter::try_new(&config.filter)
            .with_context(|| format!("invalid log filter `{}`", config.filter))?;
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));

        let tracer_provider = if config.otel_stdout {
            let provider = stdout_tracer_provider();
            let tracer = provider.tracer(SERVICE_NAME);
            global::set_tracer_provider(provider.clone());
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
            Some(provider)
        } else {
            registry
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

/// Help text for the `/metrics` exposition.
fn describe_metrics() {
    describe_counter!("form_pulse_connections_total", "WebSocket connections accepted");
    describe_gauge!("form_pulse_connections_active", "Open WebSocket connections");
    describe_gauge!("form_pulse_active_users", "Connections joined to a form type");
    describe_counter!(
        "form_pulse_events_total",
        "Client events handled, labelled by event and outcome"
    );
    describe_histogram!(
        "form_pulse_event_duration_ms",
        Unit::Milliseconds,
        "Time spent handling one client event"
    );
    describe_counter!(
        "form_pulse_validation_failures_total",
        "Inbound frames dropped before dispatch"
    );
    describe_histogram!(
        "form_pulse_field_duration_ms",
        Unit::Milliseconds,
        "Client-reported time spent on a field"
    );
    describe_histogram!(
        "form_pulse_session_duration_ms",
        Unit::Milliseconds,
        "Duration of finalized sessions"
    );
    describe_counter!(
        "form_pulse_session_finalize_failures_total",
        "Session persistence steps that failed"
    );
    describe_counter!(
        "form_pulse_broadcasts_delivered_total",
        "Events queued to room members"
    );
    describe_counter!(
        "form_pulse_broadcast_drops_total",
        "Events dropped because a member queue was full"
    );
    describe_counter!("form_pulse_store_retries_total", "Store calls retried after a transient error");
    describe_counter!(
        "form_pulse_store_write_failures_total",
        "Store writes that failed after the retry budget"
    );
    describe_counter!(
        "form_pulse_snapshot_fallbacks_total",
        "Metrics reads served as the zero snapshot"
    );
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> TelemetryConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TelemetryConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_info_without_exporter() {
        assert_eq!(
            config(&[]),
            TelemetryConfig {
                filter: "info".into(),
                otel_stdout: false,
            }
        );
    }

    #[test]
    fn rust_log_overrides_service_filter() {
        let only_service = config(&[(LOG_ENV, "form_pulse_server=debug")]);
        assert_eq!(only_service.filter, "form_pulse_server=debug");

        let both = config(&[(LOG_ENV, "debug"), ("RUST_LOG", "warn")]);
        assert_eq!(both.filter, "warn");

        let blank = config(&[("RUST_LOG", "  ")]);
        assert_eq!(blank.filter, "info");
    }

    #[test]
    fn otel_flag_accepts_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(config(&[(OTEL_STDOUT_ENV, value)]).otel_stdout, "{value}");
        }
        for value in ["0", "false", "", "enabled"] {
            assert!(!config(&[(OTEL_STDOUT_ENV, value)]).otel_stdout, "{value}");
        }
    }
}
