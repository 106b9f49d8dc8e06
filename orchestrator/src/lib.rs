//! Playground orchestrator library
//!
//! Runs one sandbox container per lesson and bridges browser terminals to
//! shells inside those containers.

use std::sync::Arc;

use tracing::{info_span, Span};

pub mod api;
pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod readiness;
pub mod runtime;
pub mod terminal;

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    /// Absent when no container runtime could be reached
    pub controller: Option<Arc<container::ContainerController>>,
    pub terminals: Option<terminal::TerminalManager>,
    pub readiness: readiness::ReadinessProbe,
}

impl AppState {
    /// Wire the terminal manager to the controller's runtime, if there is one
    pub fn new(
        config: config::AppConfig,
        controller: Option<Arc<container::ContainerController>>,
        span: &Span,
    ) -> Self {
        let terminals = controller.as_ref().map(|controller| {
            terminal::TerminalManager::new(
                controller.runtime(),
                &config,
                info_span!(parent: span, "terminals"),
            )
        });
        let readiness = readiness::ReadinessProbe::new(&config.readiness);

        Self {
            config,
            controller,
            terminals,
            readiness,
        }
    }
}
