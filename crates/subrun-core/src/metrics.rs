//! Shared `OpenTelemetry` metrics initialisation and run counters.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for both traces and metrics, sending
//! telemetry to a configurable endpoint (e.g. an `OpenTelemetry` Collector).

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Opaque handle that keeps the `OpenTelemetry` providers alive.
///
/// When dropped, the providers are **not** shut down automatically -- call
/// [`MetricsGuard::shutdown`] for a graceful flush before exiting.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Tracer for the tracing bridge layer.
    pub(crate) fn tracer(&self) -> opentelemetry_sdk::trace::Tracer {
        self.tracer_provider.tracer("subrun")
    }

    /// Gracefully shut down both providers, flushing any buffered telemetry.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces **and** metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
///
/// Returns a [`MetricsGuard`] that **must** be kept alive for the lifetime of
/// the application.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Run lifecycle counters.
#[derive(Clone)]
pub struct RunMetrics {
    spawned: Counter<u64>,
    finished: Counter<u64>,
}

impl RunMetrics {
    /// Counters on the global `subrun` meter.
    pub fn new() -> Self {
        let meter = global::meter("subrun");
        Self {
            spawned: meter
                .u64_counter("subrun.runs.spawned")
                .with_description("Subagent runs admitted")
                .build(),
            finished: meter
                .u64_counter("subrun.runs.finished")
                .with_description("Subagent runs that reached a terminal status")
                .build(),
        }
    }

    pub fn record_spawn(&self, role: &str) {
        self.spawned.add(1, &[KeyValue::new("role", role.to_string())]);
    }

    pub fn record_finish(&self, role: &str, status: &str) {
        self.finished.add(
            1,
            &[
                KeyValue::new("role", role.to_string()),
                KeyValue::new("status", status.to_string()),
            ],
        );
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn init_metrics_does_not_panic() {
        // The exporter fails at send-time without a collector; construction
        // and shutdown must still succeed.
        let guard = init_metrics("http://localhost:4317").unwrap();
        RunMetrics::new().record_spawn("backend");
        guard.shutdown().unwrap();
    }

    #[test]
    fn counters_work_without_a_provider() {
        let metrics = RunMetrics::default();
        metrics.record_spawn("frontend");
        metrics.record_finish("frontend", "ok");
    }
}
