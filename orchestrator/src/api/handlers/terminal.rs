//! Browser terminal WebSocket endpoint and session diagnostics

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::api::ApiError;
use crate::container::ContainerError;
use crate::models::SessionListResponse;
use crate::terminal::{Connection, TerminalManager};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn terminals(state: &AppState) -> Result<TerminalManager, ApiError> {
    state
        .terminals
        .clone()
        .ok_or_else(ApiError::runtime_unavailable)
}

/// Upgrade to a WebSocket attached to a shell in the requested container
pub async fn terminal_websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let terminals = terminals(&state)?;
    let requested = query
        .container_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("container_id is required".to_string()))?;
    let session_id = query
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| {
            format!("session_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
        });

    // Controller ids and names resolve to the runtime id; anything else goes to the runtime as is
    let container_id = match &state.controller {
        Some(controller) => match controller.get_container(&requested).await {
            Ok(info) => info.container_id,
            Err(ContainerError::NotFound(_)) => requested,
            Err(e) => return Err(e.into()),
        },
        None => requested,
    };

    info!(session_id = %session_id, container_id = %container_id, "Terminal WebSocket upgrade");

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = terminals
            .create_session(&session_id, &container_id, Connection::from(socket))
            .await
        {
            warn!(session_id = %session_id, error = %e, "Terminal session not established");
        }
    }))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = terminals(&state)?.list_sessions().await;
    let total = sessions.len();
    Ok(Json(SessionListResponse { sessions, total }))
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    terminals(&state)?.remove_session(&session_id).await;
    Ok(StatusCode::NO_CONTENT)
}
