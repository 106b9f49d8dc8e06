//! Container management module for the playground orchestrator
//!
//! Handles the lifecycle of per-lesson sandbox containers:
//! - Creating containers, pulling their image when needed
//! - Starting, stopping, restarting and removing them
//! - Tracking their state behind a short-lived status cache

mod cache;
mod controller;
mod types;

pub use cache::StatusCache;
pub use controller::{classify_pull_error, ContainerController, ProgressCallback};
pub use types::{
    CleanupResult, ConflictingContainer, ContainerConfig, ContainerError, ContainerInfo,
    ContainerState, ImagePullProgress, PortConflictInfo, LESSON_LABEL, MANAGED_LABEL,
};
