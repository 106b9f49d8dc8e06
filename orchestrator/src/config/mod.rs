//! Configuration module for the playground orchestrator
//!
//! Supports configuration via:
//! - YAML/TOML config files
//! - Environment variables (with PLAYGROUND_ prefix, `__` as section separator)
//! - A `.env` file in the working directory

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty, json, auto)
    #[serde(default)]
    pub log_format: LogFormat,

    /// Close every terminal session when the server shuts down
    #[serde(default = "default_true")]
    pub close_sessions_on_shutdown: bool,

    /// Container runtime connection settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Container lifecycle timings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Resource budget applied when a request does not carry one
    #[serde(default)]
    pub default_limits: ResourceLimits,

    /// Browser terminal settings
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Database readiness probe budget
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Per-lesson container defaults
    #[serde(default)]
    pub lessons: LessonsConfig,
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty output on a terminal, JSON otherwise
    #[default]
    Auto,
    Pretty,
    Json,
}

/// How to reach the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Explicit endpoint (unix://, tcp:// or http://), tried before DOCKER_HOST
    #[serde(default)]
    pub host: Option<String>,

    /// Extra socket paths tried after the well-known ones
    #[serde(default)]
    pub socket_paths: Vec<String>,

    /// Ping deadline for each candidate endpoint
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Deadline for a single runtime call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

/// Lifecycle timings for sandbox containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Grace period given to a container on stop before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// How long a start may take to reach the running state
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// How long a restart may take to reach the running state
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,

    /// Interval between state polls while waiting for a container
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Freshness window of the container status cache
    #[serde(default = "default_cache_ttl")]
    pub status_cache_ttl_secs: u64,

    /// Prefix of managed container names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

/// Resource limits for a sandbox container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in megabytes
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Maximum CPU cores (can be fractional)
    #[serde(default = "default_cpus")]
    pub cpus: f64,
}

/// Browser terminal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Shell started inside the container
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Size of each pty read forwarded to the browser
    #[serde(default = "default_read_buffer")]
    pub read_buffer_bytes: usize,

    /// Interval between exec status checks of the shell process
    #[serde(default = "default_exec_poll_interval")]
    pub exec_poll_interval_ms: u64,

    /// Text sent in the `connected` message
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
}

/// Connectivity probe budget for the lesson database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,

    #[serde(default = "default_probe_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_probe_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_probe_budget")]
    pub budget_ms: u64,
}

/// Fallbacks and per-lesson overrides used when a create request leaves fields out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonsConfig {
    #[serde(default = "default_image")]
    pub default_image: String,

    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,

    /// Command keeping an otherwise idle sandbox alive
    #[serde(default = "default_keepalive_cmd")]
    pub keepalive_cmd: Vec<String>,

    /// Port the lesson's service listens on inside the container
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    #[serde(default)]
    pub catalog: HashMap<String, LessonDefinition>,
}

/// Container settings declared by a single lesson
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LessonDefinition {
    #[serde(default)]
    pub image: Option<String>,

    /// Host port publishing the service port
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub privileged: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3006
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    10
}

fn default_start_timeout() -> u64 {
    30
}

fn default_restart_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_cache_ttl() -> u64 {
    5
}

fn default_name_prefix() -> String {
    "playground".to_string()
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_cpus() -> f64 {
    1.0
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_read_buffer() -> usize {
    1024
}

fn default_exec_poll_interval() -> u64 {
    1000
}

fn default_welcome_message() -> String {
    "Connected to sandbox terminal\r\n".to_string()
}

fn default_probe_attempts() -> u32 {
    3
}

fn default_probe_interval() -> u64 {
    300
}

fn default_probe_attempt_timeout() -> u64 {
    500
}

fn default_probe_budget() -> u64 {
    1000
}

fn default_image() -> String {
    "kwdb/kwdb:latest".to_string()
}

fn default_working_dir() -> String {
    "/root".to_string()
}

fn default_keepalive_cmd() -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        "while true; do sleep 3600; done".to_string(),
    ]
}

fn default_service_port() -> u16 {
    26257
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: None,
            socket_paths: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace(),
            start_timeout_secs: default_start_timeout(),
            restart_timeout_secs: default_restart_timeout(),
            poll_interval_ms: default_poll_interval(),
            status_cache_ttl_secs: default_cache_ttl(),
            name_prefix: default_name_prefix(),
        }
    }
}

impl LifecycleConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_secs)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64).saturating_mul(1024 * 1024)
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            read_buffer_bytes: default_read_buffer(),
            exec_poll_interval_ms: default_exec_poll_interval(),
            welcome_message: default_welcome_message(),
        }
    }
}

impl TerminalConfig {
    pub fn exec_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exec_poll_interval_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: default_probe_attempts(),
            interval_ms: default_probe_interval(),
            attempt_timeout_ms: default_probe_attempt_timeout(),
            budget_ms: default_probe_budget(),
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Default for LessonsConfig {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            default_working_dir: default_working_dir(),
            keepalive_cmd: default_keepalive_cmd(),
            service_port: default_service_port(),
            catalog: HashMap::new(),
        }
    }
}

impl LessonsConfig {
    pub fn lesson(&self, lesson_id: &str) -> Option<&LessonDefinition> {
        self.catalog.get(lesson_id)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            close_sessions_on_shutdown: true,
            runtime: RuntimeConfig::default(),
            lifecycle: LifecycleConfig::default(),
            default_limits: ResourceLimits::default(),
            terminal: TerminalConfig::default(),
            readiness: ReadinessConfig::default(),
            lessons: LessonsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/playground").required(false))
            .add_source(config::File::with_name("/etc/playground/config").required(false))
            // Override with environment variables (PLAYGROUND_ prefix)
            .add_source(
                config::Environment::with_prefix("PLAYGROUND")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.runtime.call_timeout_secs == 0 || self.runtime.connect_timeout_secs == 0 {
            anyhow::bail!("Runtime timeouts cannot be 0");
        }

        if self.lifecycle.start_timeout_secs == 0 || self.lifecycle.restart_timeout_secs == 0 {
            anyhow::bail!("Start and restart timeouts cannot be 0");
        }

        if self.lifecycle.poll_interval_ms == 0 || self.terminal.exec_poll_interval_ms == 0 {
            anyhow::bail!("Poll intervals cannot be 0");
        }

        if self.terminal.read_buffer_bytes == 0 {
            anyhow::bail!("Terminal read buffer cannot be empty");
        }

        if self.default_limits.memory_mb < 64 {
            anyhow::bail!("Minimum memory limit is 64MB");
        }

        if self.default_limits.cpus <= 0.0 {
            anyhow::bail!("CPU limit must be positive");
        }

        if self.readiness.attempts == 0 || self.readiness.budget_ms == 0 {
            anyhow::bail!("Readiness probe needs at least one attempt and a budget");
        }

        if self.lessons.default_image.trim().is_empty() || self.lessons.service_port == 0 {
            anyhow::bail!("Lessons need a default image and a service port");
        }

        if self.lifecycle.name_prefix.trim().is_empty() {
            anyhow::bail!("Container name prefix cannot be empty");
        }

        Ok(())
    }
}
