//! Metrics instrumentation: thin wrappers over the
//! global `metrics` recorder so call sites read like domain events
//! rather than raw counter/gauge/histogram calls.

use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder backing [`render`]. Called
/// once at binary startup, before any of the recording functions below
/// run.
///
/// # Panics
/// Panics if a recorder is already installed in-process.
pub fn install() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");
    HANDLE.set(handle).expect("metrics recorder already installed");
}

/// Renders the current snapshot in Prometheus text exposition format.
/// Returns an empty body if [`install`] hasn't run yet.
#[must_use]
pub fn render() -> String {
    HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

/// Records one ingestion pass outcome.
pub fn record_ingest(outcome: &str, artifacts: usize, occurrences: usize) {
    metrics::counter!("flakeguard_ingests_total", "outcome" => outcome.to_string()).increment(1);
    metrics::counter!("flakeguard_artifacts_ingested_total").increment(artifacts as u64);
    metrics::counter!("flakeguard_occurrences_stored_total").increment(occurrences as u64);
}

/// Records a platform request's outcome and latency.
pub fn record_platform_request(endpoint: &str, outcome: &str, elapsed: Duration) {
    metrics::counter!("flakeguard_platform_requests_total", "endpoint" => endpoint.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    metrics::histogram!("flakeguard_platform_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(elapsed.as_secs_f64());
}

/// Records a circuit breaker state transition.
pub fn record_breaker_transition(label: &str, state: &str) {
    metrics::counter!("flakeguard_breaker_transitions_total", "label" => label.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Reports the current job queue depth as a gauge.
pub fn set_queue_depth(kind: &str, depth: usize) {
    metrics::gauge!("flakeguard_job_queue_depth", "kind" => kind.to_string()).set(depth as f64);
}

/// Records one scoring pass.
pub fn record_score(recommendation: &str) {
    metrics::counter!("flakeguard_scores_computed_total", "recommendation" => recommendation.to_string()).increment(1);
}
