//! Container data model shared by the controller and the route layer

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::RuntimeError;

/// Label marking containers owned by the controller
pub const MANAGED_LABEL: &str = "playground.managed";

/// Label carrying the lesson a container belongs to
pub const LESSON_LABEL: &str = "playground.lesson";

/// Requested shape of a sandbox container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Image reference, e.g. `kwdb:latest`
    pub image: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host port -> container port
    #[serde(default)]
    pub ports: HashMap<u16, u16>,

    /// Host path -> container path
    #[serde(default)]
    pub volumes: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub cmd: Vec<String>,

    /// Memory limit in bytes
    #[serde(default)]
    pub memory_limit: i64,

    /// CPU limit in cores
    #[serde(default)]
    pub cpu_limit: f64,

    #[serde(default)]
    pub privileged: bool,

    /// The container runs a single job; a clean exit counts as a successful start
    #[serde(default)]
    pub one_shot: bool,
}

/// Lifecycle state of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Creating,
    Starting,
    Running,
    Restarting,
    Stopped,
    Exited,
    Error,
}

impl ContainerState {
    /// States that count towards the one-active-container-per-lesson rule
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ContainerState::Creating
                | ContainerState::Starting
                | ContainerState::Running
                | ContainerState::Restarting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Restarting => "restarting",
            ContainerState::Stopped => "stopped",
            ContainerState::Exited => "exited",
            ContainerState::Error => "error",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container known to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    /// Controller-assigned identifier
    pub id: String,
    pub lesson_id: String,
    /// Identifier assigned by the runtime
    pub container_id: String,
    pub name: String,
    pub state: ContainerState,
    pub image: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: HashMap<u16, u16>,
    #[serde(default)]
    pub one_shot: bool,
}

impl ContainerInfo {
    /// Whether `id` names this container, by controller or runtime identifier
    pub fn matches(&self, id: &str) -> bool {
        self.id == id || self.container_id == id || self.name == id
    }
}

/// Progress of an image pull, forwarded to terminals and callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePullProgress {
    pub image: String,
    pub status: String,
    /// Percentage of the current layer, when the runtime reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Container currently publishing a host port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingContainer {
    pub container_id: String,
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
}

/// Result of a host port conflict check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConflictInfo {
    pub has_conflict: bool,
    /// The port is held by a container of the same lesson
    pub is_lesson_container: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_container: Option<ConflictingContainer>,
}

/// Outcome of a bulk cleanup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub success: bool,
    pub message: String,
    /// Names of the removed containers
    pub cleaned: Vec<String>,
}

/// Errors returned by the lifecycle controller
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("invalid container request: {0}")]
    Validation(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("container {id} did not reach running state within {waited:?}")]
    Timeout { id: String, waited: Duration },

    #[error("container {id} failed to start: {reason}")]
    StartFailed { id: String, reason: String },

    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("command exited with code {exit_code}: {output}")]
    ExecFailed { exit_code: i64, output: String },

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_from_camel_case_json() {
        let json = r#"{
            "image": "kwdb:latest",
            "ports": {"26257": 26257},
            "memoryLimit": 536870912,
            "cpuLimit": 0.5,
            "workingDir": "/data"
        }"#;

        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.image, "kwdb:latest");
        assert_eq!(config.ports.get(&26257), Some(&26257));
        assert_eq!(config.memory_limit, 512 * 1024 * 1024);
        assert_eq!(config.working_dir.as_deref(), Some("/data"));
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_active_states() {
        assert!(ContainerState::Creating.is_active());
        assert!(ContainerState::Running.is_active());
        assert!(!ContainerState::Stopped.is_active());
        assert!(!ContainerState::Error.is_active());
        assert_eq!(
            serde_json::to_string(&ContainerState::Restarting).unwrap(),
            "\"restarting\""
        );
    }
}
