//! Prometheus metrics export
//!
//! Counters for container lifecycle, image pulls and terminal sessions, and
//! the scrape endpoint exposing them

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;

use crate::container::ContainerState;
use crate::AppState;

/// Prometheus metrics recorder, absent if another recorder was installed first
static METRICS_HANDLE: Lazy<Option<PrometheusHandle>> = Lazy::new(|| {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("playground_container_start_seconds".to_string()),
            &[0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0],
        )
        .and_then(|builder| builder.install_recorder())
        .map_err(|e| tracing::warn!(error = %e, "Prometheus recorder not installed"))
        .ok()
});

/// Initialize metrics system
pub fn init_metrics() {
    // Force initialization
    Lazy::force(&METRICS_HANDLE);
}

pub fn record_container_created(lesson_id: &str) {
    counter!("playground_containers_created_total", "lesson" => lesson_id.to_string()).increment(1);
}

/// Record a state transition of a managed container
pub fn record_container_state(state: ContainerState) {
    counter!("playground_container_transitions_total", "state" => state.as_str()).increment(1);
}

/// Record how long a start or restart took to settle
pub fn record_container_start(operation: &'static str, duration_secs: f64, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("playground_container_starts_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
    histogram!("playground_container_start_seconds", "operation" => operation).record(duration_secs);
}

pub fn record_image_pull(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("playground_image_pulls_total", "outcome" => outcome).increment(1);
}

pub fn record_runtime_error(operation: &'static str) {
    counter!("playground_runtime_errors_total", "operation" => operation).increment(1);
}

pub fn record_terminal_opened() {
    counter!("playground_terminal_sessions_opened_total").increment(1);
    gauge!("playground_terminal_sessions_active").increment(1.0);
}

pub fn record_terminal_closed() {
    counter!("playground_terminal_sessions_closed_total").increment(1);
    gauge!("playground_terminal_sessions_active").decrement(1.0);
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Refresh gauges from the live registries
    if let Some(terminals) = &state.terminals {
        gauge!("playground_terminal_sessions_active")
            .set(terminals.active_session_count().await as f64);
    }
    if let Some(controller) = &state.controller {
        gauge!("playground_containers_tracked").set(controller.tracked_count().await as f64);
    }

    let metrics = METRICS_HANDLE
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
}
