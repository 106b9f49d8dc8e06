//! Request and response bodies of the HTTP surface

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{LessonsConfig, ResourceLimits};
use crate::container::{ContainerConfig, ContainerInfo};
use crate::readiness::ReadinessStatus;
use crate::terminal::SessionSummary;

// ============================================================================
// Container Models
// ============================================================================

/// Body of a create request; every field falls back to the lesson's settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerRequest {
    #[serde(default)]
    pub image: Option<String>,

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
    pub cmd: Option<Vec<String>>,

    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub cpus: Option<f64>,

    #[serde(default)]
    pub privileged: Option<bool>,

    #[serde(default)]
    pub one_shot: bool,

    /// Start the container right after creating it
    #[serde(default = "default_true")]
    pub start: bool,
}

impl CreateContainerRequest {
    /// Merge the request with the lesson catalog and the default resource budget.
    ///
    /// Precedence is request, then lesson definition, then global default.
    pub fn into_config(
        self,
        lesson_id: &str,
        lessons: &LessonsConfig,
        limits: &ResourceLimits,
    ) -> ContainerConfig {
        let lesson = lessons.lesson(lesson_id).cloned().unwrap_or_default();

        let image = self
            .image
            .filter(|i| !i.trim().is_empty())
            .or(lesson.image.filter(|i| !i.trim().is_empty()))
            .unwrap_or_else(|| lessons.default_image.clone());

        let mut env = lesson.env;
        env.extend(self.env);

        let mut ports = self.ports;
        if ports.is_empty() {
            if let Some(port) = lesson.port {
                ports.insert(port, lessons.service_port);
            }
        }

        let cmd = self
            .cmd
            .filter(|c| !c.is_empty())
            .or_else(|| (!lesson.cmd.is_empty()).then_some(lesson.cmd))
            .map(normalize_cmd)
            .unwrap_or_else(|| lessons.keepalive_cmd.clone());

        let working_dir = self
            .working_dir
            .or(lesson.working_dir)
            .unwrap_or_else(|| lessons.default_working_dir.clone());

        ContainerConfig {
            image,
            env,
            ports,
            volumes: self.volumes,
            working_dir: Some(working_dir),
            cmd,
            memory_limit: self
                .memory_mb
                .map(|mb| (mb as i64).saturating_mul(1024 * 1024))
                .unwrap_or_else(|| limits.memory_bytes()),
            cpu_limit: self.cpus.unwrap_or(limits.cpus),
            privileged: self.privileged.unwrap_or(lesson.privileged),
            one_shot: self.one_shot,
        }
    }
}

/// A whole command line given as one string runs through a login shell
fn normalize_cmd(cmd: Vec<String>) -> Vec<String> {
    match cmd.as_slice() {
        [single] if single.trim().contains(char::is_whitespace) => vec![
            "/bin/bash".to_string(),
            "-lc".to_string(),
            single.trim().to_string(),
        ],
        _ => cmd,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerListResponse {
    pub containers: Vec<ContainerInfo>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    pub container_id: String,
    pub logs: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortQuery {
    /// Wide on purpose so out-of-range values reach validation
    pub port: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadyQuery {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub container_id: String,
    pub address: String,
    #[serde(flatten)]
    pub status: ReadinessStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullImageRequest {
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

// ============================================================================
// System Models
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub runtime_available: bool,
    #[serde(default)]
    pub runtime_endpoint: Option<String>,
    pub active_sessions: usize,
    pub tracked_containers: usize,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

// ============================================================================
// Error Models
// ============================================================================

/// Standard error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LessonDefinition;
    use pretty_assertions::assert_eq;

    fn lessons() -> LessonsConfig {
        let mut lessons = LessonsConfig::default();
        lessons.catalog.insert(
            "sql-basics".to_string(),
            LessonDefinition {
                image: Some("kwdb/kwdb:2.1".to_string()),
                port: Some(26257),
                cmd: vec!["./start.sh --insecure".to_string()],
                env: HashMap::from([("MODE".to_string(), "lesson".to_string())]),
                ..Default::default()
            },
        );
        lessons
    }

    #[test]
    fn test_empty_request_uses_lesson_definition() {
        let request: CreateContainerRequest = serde_json::from_str("{}").unwrap();
        assert!(request.start);

        let config = request.into_config("sql-basics", &lessons(), &ResourceLimits::default());
        assert_eq!(config.image, "kwdb/kwdb:2.1");
        assert_eq!(config.ports, HashMap::from([(26257, 26257)]));
        assert_eq!(
            config.cmd,
            vec!["/bin/bash", "-lc", "./start.sh --insecure"]
        );
        assert_eq!(config.working_dir.as_deref(), Some("/root"));
        assert_eq!(config.memory_limit, 1024 * 1024 * 1024);
        assert_eq!(config.env.get("MODE").map(String::as_str), Some("lesson"));
    }

    #[test]
    fn test_request_overrides_lesson() {
        let request: CreateContainerRequest = serde_json::from_str(
            r#"{"image": "kwdb/kwdb:dev", "ports": {"36257": 26257}, "memoryMb": 512, "env": {"MODE": "debug"}, "start": false}"#,
        )
        .unwrap();
        assert!(!request.start);

        let config = request.into_config("sql-basics", &lessons(), &ResourceLimits::default());
        assert_eq!(config.image, "kwdb/kwdb:dev");
        assert_eq!(config.ports, HashMap::from([(36257, 26257)]));
        assert_eq!(config.memory_limit, 512 * 1024 * 1024);
        assert_eq!(config.env.get("MODE").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_unknown_lesson_falls_back_to_defaults() {
        let config = CreateContainerRequest::default().into_config(
            "unknown",
            &LessonsConfig::default(),
            &ResourceLimits::default(),
        );
        assert_eq!(config.image, "kwdb/kwdb:latest");
        assert!(config.ports.is_empty());
        assert_eq!(config.cmd[0], "/bin/bash");
        assert_eq!(config.cpu_limit, 1.0);
    }
}
