//! Prometheus metrics

use crate::models::descriptor::ModelId;
use crate::models::janitor::CleanupReport;
use crate::readiness::{FailureClass, ReadinessState};
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record the start of an acquisition workflow
pub fn record_acquisition_started(model: ModelId) {
    metrics::counter!("model_warden_acquisitions_started_total",
        "model" => model.as_str()
    )
    .increment(1);
}

/// Record a state transition
pub fn record_state_transition(model: ModelId, state: &ReadinessState) {
    metrics::counter!("model_warden_state_transitions_total",
        "model" => model.as_str(),
        "state" => state.name()
    )
    .increment(1);
}

/// Record a download handed to the downloader
pub fn record_download_started(model: ModelId) {
    metrics::counter!("model_warden_downloads_total",
        "model" => model.as_str()
    )
    .increment(1);
}

/// Record a retry after a recoverable failure
pub fn record_retry(model: ModelId, class: FailureClass) {
    metrics::counter!("model_warden_retries_total",
        "model" => model.as_str(),
        "class" => class.category()
    )
    .increment(1);
}

/// Record time spent waiting on an external download
pub fn record_external_wait(model: ModelId, timed_out: bool) {
    metrics::counter!("model_warden_external_waits_total",
        "model" => model.as_str(),
        "timed_out" => if timed_out { "true" } else { "false" }
    )
    .increment(1);
}

/// Record how an acquisition workflow ended
pub fn record_outcome(model: ModelId, class: Option<FailureClass>) {
    let result = class.map(FailureClass::category).unwrap_or("ready");
    metrics::counter!("model_warden_outcomes_total",
        "model" => model.as_str(),
        "result" => result
    )
    .increment(1);
}

/// Record removed and failed cleanup entries
pub fn record_cleanup(report: &CleanupReport) {
    metrics::counter!("model_warden_cleanup_removed_total").increment(report.removed.len() as u64);
    metrics::counter!("model_warden_cleanup_failed_total").increment(report.failed.len() as u64);
}

/// Update the readiness gauge (1 when the active model is ready)
pub fn update_ready(ready: bool) {
    metrics::gauge!("model_warden_ready").set(if ready { 1.0 } else { 0.0 });
}
