//! HTTP surface of the playground orchestrator
//!
//! Provides:
//! - Lesson container lifecycle endpoints
//! - The browser terminal WebSocket
//! - Health and Prometheus metrics

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::AppState;

pub use error::ApiError;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        // Prometheus metrics (no auth for scraping)
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route(
            "/ws/terminal",
            get(handlers::terminal::terminal_websocket_handler),
        )
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}

/// API v1 routes
fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Lesson-scoped endpoints
        .route(
            "/lessons/:lesson_id/containers",
            post(handlers::containers::create_lesson_container)
                .delete(handlers::containers::cleanup_lesson),
        )
        .route(
            "/lessons/:lesson_id/port-conflict",
            get(handlers::containers::port_conflict),
        )
        // Container endpoints
        .route(
            "/containers",
            get(handlers::containers::list_containers).delete(handlers::containers::cleanup_all),
        )
        .route(
            "/containers/:id",
            get(handlers::containers::get_container)
                .delete(handlers::containers::delete_container),
        )
        .route(
            "/containers/:id/start",
            post(handlers::containers::start_container),
        )
        .route(
            "/containers/:id/stop",
            post(handlers::containers::stop_container),
        )
        .route(
            "/containers/:id/restart",
            post(handlers::containers::restart_container),
        )
        .route(
            "/containers/:id/logs",
            get(handlers::containers::container_logs),
        )
        .route(
            "/containers/:id/exec",
            post(handlers::containers::exec_command),
        )
        .route(
            "/containers/:id/ready",
            get(handlers::containers::container_ready),
        )
        .route("/images/pull", post(handlers::containers::pull_image))
        // Terminal diagnostics
        .route(
            "/terminal/sessions",
            get(handlers::terminal::list_sessions),
        )
        .route(
            "/terminal/sessions/:session_id",
            delete(handlers::terminal::close_session),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::container::ContainerController;
    use crate::runtime::InMemoryRuntime;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;
    use tracing::Span;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.lifecycle.poll_interval_ms = 10;
        config.lifecycle.start_timeout_secs = 1;
        config.runtime.call_timeout_secs = 2;
        config
    }

    fn degraded_router() -> Router {
        create_router(Arc::new(AppState::new(test_config(), None, &Span::none())))
    }

    fn router_with(runtime: &InMemoryRuntime) -> Router {
        let config = test_config();
        let controller = ContainerController::new(Arc::new(runtime.clone()), &config, Span::none());
        create_router(Arc::new(AppState::new(
            config,
            Some(Arc::new(controller)),
            &Span::none(),
        )))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_degraded_mode() {
        let router = degraded_router();

        let (status, body) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["runtime_available"], false);

        let (status, body) = send(&router, "GET", "/api/v1/containers", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "SERVICE_UNAVAILABLE");

        let (status, _) = send(&router, "GET", "/api/v1/terminal/sessions", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_create_lesson_container_starts_it() {
        let runtime = InMemoryRuntime::new();
        let router = router_with(&runtime);

        let (status, body) = send(
            &router,
            "POST",
            "/api/v1/lessons/L1/containers",
            Some(r#"{"image": "kwdb:latest", "ports": {"26257": 26257}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "running");
        assert_eq!(body["lessonId"], "L1");
        assert!(runtime.has_image("kwdb:latest"));

        let id = body["id"].as_str().unwrap().to_string();
        let (status, body) = send(&router, "GET", &format!("/api/v1/containers/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());

        let (status, body) = send(&router, "GET", "/api/v1/containers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (status, _) = send(&router, "POST", &format!("/api/v1/containers/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, "DELETE", &format!("/api/v1/containers/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_without_body_uses_defaults() {
        let runtime = InMemoryRuntime::new();
        let router = router_with(&runtime);

        let (status, body) = send(&router, "POST", "/api/v1/lessons/L2/containers", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["image"], "kwdb/kwdb:latest");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let runtime = InMemoryRuntime::new();
        let router = router_with(&runtime);

        let (status, body) = send(&router, "GET", "/api/v1/containers/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");

        let (status, _) = send(
            &router,
            "GET",
            "/api/v1/lessons/L1/port-conflict?port=70000",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &router,
            "GET",
            "/api/v1/lessons/L1/port-conflict?port=26257",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasConflict"], false);
    }

    #[tokio::test]
    async fn test_logs_and_cleanup() {
        let runtime = InMemoryRuntime::new();
        let router = router_with(&runtime);

        let (_, body) = send(
            &router,
            "POST",
            "/api/v1/lessons/L1/containers",
            Some(r#"{"image": "kwdb:latest"}"#),
        )
        .await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &router,
            "GET",
            &format!("/api/v1/containers/{}/logs?tail=10", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["logs"].as_str().unwrap().contains("sandbox ready"));

        let (status, body) = send(&router, "DELETE", "/api/v1/lessons/L1/containers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(runtime.container_count(), 0);
    }
}
