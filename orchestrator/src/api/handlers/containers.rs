//! Container lifecycle handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::api::ApiError;
use crate::container::{CleanupResult, ContainerController, ContainerInfo, PortConflictInfo};
use crate::models::{
    ContainerListResponse, CreateContainerRequest, ExecRequest, ExecResponse, LogsQuery,
    LogsResponse, PortQuery, PullImageRequest, ReadinessResponse, ReadyQuery,
};
use crate::AppState;

/// Controller handle, or 503 when running without a container runtime
pub(crate) fn controller(state: &AppState) -> Result<Arc<ContainerController>, ApiError> {
    state
        .controller
        .clone()
        .ok_or_else(ApiError::runtime_unavailable)
}

/// List every managed container
pub async fn list_containers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ContainerListResponse>, ApiError> {
    let containers = controller(&state)?.list_containers().await;
    let total = containers.len();
    Ok(Json(ContainerListResponse { containers, total }))
}

/// Create (and by default start) the sandbox container of a lesson
pub async fn create_lesson_container(
    State(state): State<Arc<AppState>>,
    Path(lesson_id): Path<String>,
    request: Option<Json<CreateContainerRequest>>,
) -> Result<(StatusCode, Json<ContainerInfo>), ApiError> {
    let controller = controller(&state)?;
    let request = request.map(|Json(r)| r).unwrap_or_else(|| CreateContainerRequest {
        start: true,
        ..Default::default()
    });
    let start = request.start;
    let config = request.into_config(&lesson_id, &state.config.lessons, &state.config.default_limits);

    // Pull progress goes out to every open terminal
    let progress = state
        .terminals
        .as_ref()
        .map(|terminals| terminals.progress_forwarder());

    let mut created = controller
        .create_container_with_progress(&lesson_id, config, progress)
        .await?;
    if start {
        created = controller.start_container(&created.id).await?;
    }

    info!(lesson_id = %lesson_id, id = %created.id, state = %created.state, "Lesson container ready");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    Ok(Json(controller(&state)?.get_container(&id).await?))
}

pub async fn delete_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    controller(&state)?.remove_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    Ok(Json(controller(&state)?.start_container(&id).await?))
}

pub async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    Ok(Json(controller(&state)?.stop_container(&id).await?))
}

pub async fn restart_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    Ok(Json(controller(&state)?.restart_container(&id).await?))
}

pub async fn container_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let logs = controller(&state)?.get_container_logs(&id, query.tail).await?;
    Ok(Json(LogsResponse {
        container_id: id,
        logs,
    }))
}

/// Run a one-off command inside a container
pub async fn exec_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let output = controller(&state)?.exec_command(&id, request.cmd).await?;
    Ok(Json(ExecResponse { output }))
}

/// Probe whether the service published by a container accepts connections
pub async fn container_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ReadyQuery>,
) -> Result<Json<ReadinessResponse>, ApiError> {
    let info = controller(&state)?.get_container(&id).await?;

    let service_port = state.config.lessons.service_port;
    let port = query
        .port
        .or_else(|| {
            info.ports
                .iter()
                .find(|(_, container)| **container == service_port)
                .map(|(host, _)| *host)
        })
        .or_else(|| info.ports.keys().min().copied())
        .ok_or_else(|| {
            ApiError::BadRequest(format!("container {} publishes no port", info.id))
        })?;

    let host = query.host.unwrap_or_else(|| "127.0.0.1".to_string());
    let address = format!("{}:{}", host, port);
    let status = state.readiness.check(&address).await;

    Ok(Json(ReadinessResponse {
        container_id: info.id,
        address,
        status,
    }))
}

pub async fn port_conflict(
    State(state): State<Arc<AppState>>,
    Path(lesson_id): Path<String>,
    Query(query): Query<PortQuery>,
) -> Result<Json<PortConflictInfo>, ApiError> {
    Ok(Json(
        controller(&state)?
            .check_port_conflict(&lesson_id, query.port)
            .await?,
    ))
}

pub async fn cleanup_lesson(
    State(state): State<Arc<AppState>>,
    Path(lesson_id): Path<String>,
) -> Result<Json<CleanupResult>, ApiError> {
    Ok(Json(
        controller(&state)?
            .cleanup_lesson_containers(&lesson_id)
            .await?,
    ))
}

pub async fn cleanup_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CleanupResult>, ApiError> {
    Ok(Json(controller(&state)?.cleanup_all_containers().await?))
}

pub async fn pull_image(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PullImageRequest>,
) -> Result<StatusCode, ApiError> {
    controller(&state)?.pull_image(&request.image).await?;
    Ok(StatusCode::NO_CONTENT)
}
