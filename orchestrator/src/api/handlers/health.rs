//! Health check handler

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, Json};
use once_cell::sync::Lazy;

use crate::models::{HealthResponse, HealthStatus};
use crate::AppState;

/// Server start time for uptime calculation
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = START_TIME.elapsed().as_secs();

    let active_sessions = match &state.terminals {
        Some(terminals) => terminals.active_session_count().await,
        None => 0,
    };

    let (runtime_available, runtime_endpoint, tracked_containers) = match &state.controller {
        Some(controller) => (
            controller.ping().await,
            Some(controller.endpoint()),
            controller.tracked_count().await,
        ),
        None => (false, None, 0),
    };

    let status = if runtime_available {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        runtime_available,
        runtime_endpoint,
        active_sessions,
        tracked_containers,
    })
}
