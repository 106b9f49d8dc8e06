//! Playground orchestrator - per-lesson sandbox containers and browser terminals
//!
//! Connects to the local container runtime, serves the lesson container API
//! and bridges terminal WebSockets to shells inside the sandboxes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderName;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};

use playground_orchestrator::api::create_router;
use playground_orchestrator::config::AppConfig;
use playground_orchestrator::container::ContainerController;
use playground_orchestrator::logging::init_logging;
use playground_orchestrator::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting playground orchestrator"
    );

    // Initialize metrics system
    playground_orchestrator::metrics::init_metrics();
    info!("Prometheus metrics initialized");

    let root = info_span!("orchestrator");

    // Keep serving without container features when no runtime answers
    let controller =
        match ContainerController::connect(&config, info_span!(parent: &root, "controller")).await {
            Ok(controller) => {
                info!(endpoint = %controller.endpoint(), "Container controller ready");
                Some(Arc::new(controller))
            }
            Err(e) => {
                warn!(error = %e, "Container runtime unavailable, running in degraded mode");
                None
            }
        };

    let state = Arc::new(AppState::new(config.clone(), controller, &root));

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state.clone()).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::new(x_request_id))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
    );

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Terminals close on the signal itself, before connections drain
    let terminals = state
        .terminals
        .clone()
        .filter(|_| config.close_sessions_on_shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down...");
            if let Some(terminals) = terminals {
                terminals.close_all().await;
            }
        })
        .await?;

    info!("Playground orchestrator stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
