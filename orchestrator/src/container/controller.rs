//! Lifecycle controller for per-lesson sandbox containers

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::container::Config;
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerInspectResponse, ContainerState as RuntimeState, ContainerStateStatusEnum,
    HostConfig, PortBinding,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn, Span};
use uuid::Uuid;

use super::cache::StatusCache;
use super::types::{
    CleanupResult, ConflictingContainer, ContainerConfig, ContainerError, ContainerInfo,
    ContainerState, ImagePullProgress, PortConflictInfo, LESSON_LABEL, MANAGED_LABEL,
};
use crate::config::{AppConfig, LifecycleConfig};
use crate::metrics;
use crate::runtime::{with_timeout, ContainerRuntime, DockerRuntime, RuntimeError};

/// Receives image pull progress while a container is being prepared
pub type ProgressCallback = Arc<dyn Fn(ImagePullProgress) + Send + Sync>;

/// Owns every sandbox container and drives its state transitions
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,

    /// Registry keyed by controller id
    containers: RwLock<HashMap<String, ContainerInfo>>,

    /// One lock per lesson, serializing create and cleanup
    lesson_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,

    cache: StatusCache,
    lifecycle: LifecycleConfig,
    call_timeout: Duration,
    span: Span,
}

impl ContainerController {
    /// Connect to the container runtime and recover containers left by a previous run.
    ///
    /// Fails only when no runtime endpoint answers; callers should keep
    /// serving without container features in that case.
    pub async fn connect(config: &AppConfig, span: Span) -> Result<Self, ContainerError> {
        let runtime = DockerRuntime::connect(&config.runtime)
            .await
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;

        let controller = Self::new(Arc::new(runtime), config, span);
        if let Err(e) = controller.load_existing().await {
            warn!(parent: &controller.span, error = %e, "Failed to recover existing containers");
        }
        Ok(controller)
    }

    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &AppConfig, span: Span) -> Self {
        Self {
            runtime,
            containers: RwLock::new(HashMap::new()),
            lesson_locks: RwLock::new(HashMap::new()),
            cache: StatusCache::new(config.lifecycle.status_cache_ttl()),
            lifecycle: config.lifecycle.clone(),
            call_timeout: config.runtime.call_timeout(),
            span,
        }
    }

    /// Shared handle to the runtime, used by the terminal manager
    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    pub fn endpoint(&self) -> String {
        self.runtime.endpoint()
    }

    /// Number of containers in the registry
    pub async fn tracked_count(&self) -> usize {
        self.containers.read().await.len()
    }

    /// Whether the runtime still answers
    pub async fn ping(&self) -> bool {
        self.call("ping", self.runtime.ping()).await.is_ok()
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, DockerError>>,
    {
        self.call_with(op, self.call_timeout, fut).await
    }

    async fn call_with<T, F>(
        &self,
        op: &'static str,
        timeout: Duration,
        fut: F,
    ) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, DockerError>>,
    {
        let result = with_timeout(op, timeout, fut).await;
        if let Err(e) = &result {
            if !e.is_not_found() && !e.is_not_modified() {
                metrics::record_runtime_error(op);
            }
        }
        result
    }

    /// Register containers carrying the managed label
    pub async fn load_existing(&self) -> Result<usize, ContainerError> {
        let summaries = self
            .call(
                "list_containers",
                self.runtime
                    .list_containers(Some(format!("{}=true", MANAGED_LABEL))),
            )
            .await?;

        let mut recovered = 0;
        for summary in summaries {
            let Some(container_id) = summary.id else {
                continue;
            };
            let labels = summary.labels.unwrap_or_default();
            let Some(lesson_id) = labels.get(LESSON_LABEL).cloned() else {
                continue;
            };
            if self.find(&container_id).await.is_some() {
                continue;
            }

            let inspect = match self
                .call(
                    "inspect_container",
                    self.runtime.inspect_container(&container_id),
                )
                .await
            {
                Ok(inspect) => inspect,
                Err(e) => {
                    warn!(parent: &self.span, container_id = %container_id, error = %e, "Skipping unrecoverable container");
                    continue;
                }
            };

            let info = recovered_info(&lesson_id, &container_id, &inspect);
            debug!(parent: &self.span, lesson_id = %lesson_id, name = %info.name, state = %info.state, "Recovered container");
            self.containers
                .write()
                .await
                .insert(info.id.clone(), info.clone());
            self.cache.put(info).await;
            recovered += 1;
        }

        info!(parent: &self.span, recovered, "Loaded existing containers");
        Ok(recovered)
    }

    /// Create the sandbox container for a lesson, replacing any previous one
    pub async fn create_container(
        &self,
        lesson_id: &str,
        config: ContainerConfig,
    ) -> Result<ContainerInfo, ContainerError> {
        self.create_container_with_progress(lesson_id, config, None)
            .await
    }

    /// Like [`Self::create_container`], reporting image pull progress to `progress`
    pub async fn create_container_with_progress(
        &self,
        lesson_id: &str,
        config: ContainerConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<ContainerInfo, ContainerError> {
        validate(lesson_id, &config)?;

        self.ensure_image(&config.image, progress.as_ref()).await?;

        let lock = self.lesson_lock(lesson_id).await;
        let _guard = lock.lock().await;

        let replaced = self.remove_lesson_entries(lesson_id).await;
        if !replaced.is_empty() {
            info!(parent: &self.span, lesson_id = %lesson_id, replaced = replaced.len(), "Removed previous lesson containers");
        }

        let name = container_name(&self.lifecycle.name_prefix, lesson_id);
        let create_config = runtime_config(lesson_id, &config);

        let created = self
            .call(
                "create_container",
                self.runtime.create_container(&name, create_config),
            )
            .await
            .map_err(|e| {
                error!(parent: &self.span, lesson_id = %lesson_id, image = %config.image, error = %e, "Failed to create container");
                e
            })?;

        for warning in &created.warnings {
            warn!(parent: &self.span, name = %name, warning = %warning, "Runtime warning on create");
        }

        let info = ContainerInfo {
            id: Uuid::new_v4().to_string(),
            lesson_id: lesson_id.to_string(),
            container_id: created.id,
            name,
            state: ContainerState::Creating,
            image: config.image.clone(),
            created_at: Utc::now(),
            started_at: None,
            exit_code: None,
            message: None,
            env: config.env.clone(),
            ports: config.ports.clone(),
            one_shot: config.one_shot,
        };

        {
            let mut containers = self.containers.write().await;
            containers.insert(info.id.clone(), info.clone());
            self.cache.put(info.clone()).await;
        }

        metrics::record_container_created(lesson_id);
        metrics::record_container_state(ContainerState::Creating);
        info!(parent: &self.span, lesson_id = %lesson_id, id = %info.id, name = %info.name, "Container created");

        Ok(info)
    }

    /// Start a container and wait until it runs, crashes, or the start timeout elapses
    pub async fn start_container(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        let info = self.lookup(id).await?;
        let started = Instant::now();
        let timeout = self.lifecycle.start_timeout();
        let deadline = started + timeout;
        info!(parent: &self.span, id = %info.id, name = %info.name, "Starting container");

        self.update(&info.id, |c| {
            c.state = ContainerState::Starting;
            c.message = Some("Container is starting".to_string());
        })
        .await?;

        if let Err(e) = self
            .call_with(
                "start_container",
                self.call_timeout.min(timeout),
                self.runtime.start_container(&info.container_id),
            )
            .await
        {
            if !e.is_not_modified() {
                let reason = format!("Failed to start: {}", e);
                self.mark_error(&info.id, &reason).await;
                metrics::record_container_start("start", started.elapsed().as_secs_f64(), false);
                return Err(ContainerError::StartFailed {
                    id: info.id,
                    reason,
                });
            }
        }

        let result = self.await_running(&info.id, deadline, timeout).await;
        metrics::record_container_start("start", started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    /// Stop a container with the configured grace period
    pub async fn stop_container(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        let info = self.lookup(id).await?;
        let grace = self.lifecycle.stop_grace();
        info!(parent: &self.span, id = %info.id, name = %info.name, grace = ?grace, "Stopping container");

        match self
            .call_with(
                "stop_container",
                grace + self.call_timeout,
                self.runtime.stop_container(&info.container_id, grace),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_modified() => {
                debug!(parent: &self.span, id = %info.id, "Container was already stopped");
            }
            Err(e) => {
                self.mark_error(&info.id, &format!("Failed to stop: {}", e))
                    .await;
                return Err(e.into());
            }
        }

        self.update(&info.id, |c| {
            c.state = ContainerState::Stopped;
            c.message = None;
        })
        .await
    }

    /// Restart a container and wait until it runs again
    pub async fn restart_container(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        let info = self.lookup(id).await?;
        let grace = self.lifecycle.stop_grace();
        let started = Instant::now();
        let timeout = self.lifecycle.restart_timeout();
        let deadline = started + grace + timeout;
        info!(parent: &self.span, id = %info.id, name = %info.name, "Restarting container");

        self.update(&info.id, |c| {
            c.state = ContainerState::Restarting;
            c.message = Some("Container is restarting".to_string());
        })
        .await?;

        if let Err(e) = self
            .call_with(
                "restart_container",
                grace + self.call_timeout,
                self.runtime.restart_container(&info.container_id, grace),
            )
            .await
        {
            let reason = format!("Failed to restart: {}", e);
            self.mark_error(&info.id, &reason).await;
            metrics::record_container_start("restart", started.elapsed().as_secs_f64(), false);
            return Err(ContainerError::StartFailed {
                id: info.id,
                reason,
            });
        }

        let result = self.await_running(&info.id, deadline, timeout).await;
        metrics::record_container_start("restart", started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    /// Force-remove a container and forget it
    pub async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        let info = self.lookup(id).await?;

        match self
            .call(
                "remove_container",
                self.runtime.remove_container(&info.container_id, true),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(parent: &self.span, id = %info.id, "Container already gone from runtime");
            }
            Err(e) => {
                self.mark_error(&info.id, &format!("Failed to remove: {}", e))
                    .await;
                return Err(e.into());
            }
        }

        self.forget(&info.id).await;
        info!(parent: &self.span, id = %info.id, name = %info.name, "Container removed");
        Ok(())
    }

    /// Current view of a container, served from the status cache when fresh
    pub async fn get_container(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        let info = self.lookup(id).await?;
        if let Some(cached) = self.cache.get(&info.id).await {
            return Ok(cached);
        }
        self.refresh(&info).await
    }

    pub async fn is_container_running(&self, id: &str) -> Result<bool, ContainerError> {
        Ok(self.get_container(id).await?.state == ContainerState::Running)
    }

    /// Every known container, oldest first
    pub async fn list_containers(&self) -> Vec<ContainerInfo> {
        let known: Vec<ContainerInfo> = self.containers.read().await.values().cloned().collect();

        let mut listed = Vec::with_capacity(known.len());
        for info in known {
            match self.get_container(&info.id).await {
                Ok(current) => listed.push(current),
                Err(ContainerError::NotFound(_)) => {}
                Err(e) => {
                    warn!(parent: &self.span, id = %info.id, error = %e, "Serving last known state");
                    listed.push(info);
                }
            }
        }
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            debug!(parent: &self.span, purged, "Dropped expired status entries");
        }
        listed
    }

    /// Containers registered for one lesson
    pub async fn lesson_containers(&self, lesson_id: &str) -> Vec<ContainerInfo> {
        self.containers
            .read()
            .await
            .values()
            .filter(|c| c.lesson_id == lesson_id)
            .cloned()
            .collect()
    }

    /// Recent container output, stdout and stderr interleaved
    pub async fn get_container_logs(
        &self,
        id: &str,
        tail: Option<usize>,
    ) -> Result<String, ContainerError> {
        let info = self.lookup(id).await?;
        let mut stream = self.runtime.logs(&info.container_id, tail, false);

        let collect = async move {
            let mut output = String::new();
            while let Some(frame) = stream.next().await {
                output.push_str(&frame?.to_string());
            }
            Ok::<_, DockerError>(output)
        };

        Ok(self.call("logs", collect).await?)
    }

    /// Pull an image regardless of whether it is present
    pub async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        validate_image(image)?;
        self.pull_with_progress(image, None).await
    }

    /// Run a command to completion inside a container and return its output
    pub async fn exec_command(
        &self,
        id: &str,
        cmd: Vec<String>,
    ) -> Result<String, ContainerError> {
        if cmd.is_empty() {
            return Err(ContainerError::Validation("command cannot be empty".to_string()));
        }
        let info = self.lookup(id).await?;
        debug!(parent: &self.span, id = %info.id, cmd = ?cmd, "Executing command");

        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec_id = self
            .call(
                "create_exec",
                self.runtime.create_exec(&info.container_id, options),
            )
            .await?;

        let runtime = self.runtime.clone();
        let exec = exec_id.clone();
        let run = async move {
            let mut output = String::new();
            if let StartExecResults::Attached { output: mut frames, .. } =
                runtime.start_exec(&exec, StartExecOptions::default()).await?
            {
                while let Some(frame) = frames.next().await {
                    output.push_str(&frame?.to_string());
                }
            }
            Ok::<_, DockerError>(output)
        };
        let output = self.call("start_exec", run).await?;

        let inspect = self
            .call("inspect_exec", self.runtime.inspect_exec(&exec_id))
            .await?;
        match inspect.exit_code.unwrap_or(0) {
            0 => Ok(output),
            exit_code => Err(ContainerError::ExecFailed { exit_code, output }),
        }
    }

    /// Resize the pseudo-terminal of an exec instance
    pub async fn resize_terminal(
        &self,
        exec_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), ContainerError> {
        if rows == 0 || cols == 0 {
            return Err(ContainerError::Validation(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }

        match self
            .call("resize_exec", self.runtime.resize_exec(exec_id, rows, cols))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(ContainerError::NotFound(exec_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Report which running container, if any, publishes `port` on the host
    pub async fn check_port_conflict(
        &self,
        lesson_id: &str,
        port: u32,
    ) -> Result<PortConflictInfo, ContainerError> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ContainerError::Validation(format!("invalid port {}", port)))?;

        let summaries = self
            .call("list_containers", self.runtime.list_containers(None))
            .await?;

        for summary in summaries {
            if summary.state.as_deref() != Some("running") {
                continue;
            }
            let publishes = summary
                .ports
                .as_ref()
                .map(|ports| ports.iter().any(|p| p.public_port == Some(port)))
                .unwrap_or(false);
            if !publishes {
                continue;
            }

            let owner = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LESSON_LABEL))
                .cloned();
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();

            return Ok(PortConflictInfo {
                has_conflict: true,
                is_lesson_container: owner.as_deref() == Some(lesson_id),
                conflict_container: Some(ConflictingContainer {
                    container_id: summary.id.unwrap_or_default(),
                    name,
                    image: summary.image.unwrap_or_default(),
                    lesson_id: owner,
                }),
            });
        }

        Ok(PortConflictInfo {
            has_conflict: false,
            is_lesson_container: false,
            conflict_container: None,
        })
    }

    /// Remove every container of a lesson, registered or only labeled in the runtime
    pub async fn cleanup_lesson_containers(
        &self,
        lesson_id: &str,
    ) -> Result<CleanupResult, ContainerError> {
        let lock = self.lesson_lock(lesson_id).await;
        let guard = lock.lock().await;

        let mut cleaned: Vec<String> = self
            .remove_lesson_entries(lesson_id)
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();

        let swept = self
            .sweep_runtime(format!("{}={}", LESSON_LABEL, lesson_id), &mut cleaned)
            .await;

        drop(guard);
        self.release_lesson_lock(lesson_id, lock).await;

        let failed = swept?;
        Ok(cleanup_result(
            cleaned,
            failed,
            &format!("for lesson {}", lesson_id),
        ))
    }

    /// Remove every managed container
    pub async fn cleanup_all_containers(&self) -> Result<CleanupResult, ContainerError> {
        let known: Vec<ContainerInfo> = self.containers.read().await.values().cloned().collect();

        let mut cleaned = Vec::new();
        let mut failed = 0;
        for info in known {
            if self.teardown(&info).await {
                cleaned.push(info.name);
            } else {
                failed += 1;
            }
        }

        failed += self
            .sweep_runtime(format!("{}=true", MANAGED_LABEL), &mut cleaned)
            .await?;

        Ok(cleanup_result(cleaned, failed, "in total"))
    }

    /// Remove runtime containers matching `label` that the registry does not know
    async fn sweep_runtime(
        &self,
        label: String,
        cleaned: &mut Vec<String>,
    ) -> Result<usize, ContainerError> {
        let summaries = self
            .call("list_containers", self.runtime.list_containers(Some(label)))
            .await?;

        let mut failed = 0;
        for summary in summaries {
            let Some(container_id) = summary.id else {
                continue;
            };
            if self.find(&container_id).await.is_some() {
                continue;
            }
            let name = summary
                .names
                .and_then(|names| names.into_iter().next())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| container_id.clone());

            match self
                .call(
                    "remove_container",
                    self.runtime.remove_container(&container_id, true),
                )
                .await
            {
                Ok(()) => cleaned.push(name),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(parent: &self.span, name = %name, error = %e, "Failed to remove orphaned container");
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    async fn lesson_lock(&self, lesson_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.lesson_locks.read().await.get(lesson_id) {
            return lock.clone();
        }
        let mut locks = self.lesson_locks.write().await;
        locks
            .entry(lesson_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget a lesson's lock once no other task holds or waits on it
    async fn release_lesson_lock(&self, lesson_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.lesson_locks.write().await;
        if locks
            .get(lesson_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(lesson_id);
        }
    }

    /// Tear down and forget every registered container of a lesson
    async fn remove_lesson_entries(&self, lesson_id: &str) -> Vec<ContainerInfo> {
        let existing = self.lesson_containers(lesson_id).await;
        let mut removed = Vec::with_capacity(existing.len());
        for info in existing {
            if !self.teardown(&info).await {
                warn!(parent: &self.span, id = %info.id, name = %info.name, "Forgetting container that could not be removed");
                self.forget(&info.id).await;
            }
            removed.push(info);
        }
        removed
    }

    /// Best-effort stop and force-remove; returns whether the runtime let go of it
    async fn teardown(&self, info: &ContainerInfo) -> bool {
        let grace = self.lifecycle.stop_grace();
        match self
            .call_with(
                "stop_container",
                grace + self.call_timeout,
                self.runtime.stop_container(&info.container_id, grace),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_modified() || e.is_not_found() => {}
            Err(e) => {
                warn!(parent: &self.span, id = %info.id, error = %e, "Failed to stop container during cleanup");
            }
        }

        let removed = match self
            .call(
                "remove_container",
                self.runtime.remove_container(&info.container_id, true),
            )
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(parent: &self.span, id = %info.id, error = %e, "Failed to remove container during cleanup");
                false
            }
        };

        if removed {
            self.forget(&info.id).await;
        }
        removed
    }

    async fn forget(&self, id: &str) {
        self.containers.write().await.remove(id);
        self.cache.invalidate(id).await;
    }

    async fn find(&self, id: &str) -> Option<ContainerInfo> {
        let containers = self.containers.read().await;
        containers
            .get(id)
            .or_else(|| containers.values().find(|c| c.matches(id)))
            .cloned()
    }

    async fn lookup(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        self.find(id)
            .await
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))
    }

    /// Apply `change` to a registry entry and mirror the result into the cache
    async fn update<F>(&self, id: &str, change: F) -> Result<ContainerInfo, ContainerError>
    where
        F: FnOnce(&mut ContainerInfo),
    {
        let mut containers = self.containers.write().await;
        let entry = containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;

        let before = entry.state;
        change(entry);
        let updated = entry.clone();
        if updated.state != before {
            metrics::record_container_state(updated.state);
            debug!(parent: &self.span, id = %id, from = %before, to = %updated.state, "Container state changed");
        }

        self.cache.put(updated.clone()).await;
        Ok(updated)
    }

    async fn mark_error(&self, id: &str, message: &str) {
        error!(parent: &self.span, id = %id, message = %message, "Container entered error state");
        let message = message.to_string();
        let _ = self
            .update(id, |c| {
                c.state = ContainerState::Error;
                c.message = Some(message);
            })
            .await;
    }

    /// Inspect the runtime and reconcile the registry entry with what it reports
    async fn refresh(&self, info: &ContainerInfo) -> Result<ContainerInfo, ContainerError> {
        self.refresh_within(info, self.call_timeout).await
    }

    async fn refresh_within(
        &self,
        info: &ContainerInfo,
        timeout: Duration,
    ) -> Result<ContainerInfo, ContainerError> {
        let inspect = match self
            .call_with(
                "inspect_container",
                timeout,
                self.runtime.inspect_container(&info.container_id),
            )
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if e.is_not_found() => {
                return self
                    .update(&info.id, |c| {
                        if c.state != ContainerState::Error {
                            c.state = ContainerState::Error;
                            c.message =
                                Some("Container was removed outside the controller".to_string());
                        }
                    })
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        self.update(&info.id, |c| reconcile(c, &inspect)).await
    }

    /// Poll through the status cache until the container settles or `deadline` passes
    async fn await_running(
        &self,
        id: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ContainerInfo, ContainerError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            // Every attempt goes to the runtime and rewrites the cache entry
            self.cache.invalidate(id).await;
            let observed = match self.lookup(id).await {
                Ok(info) => {
                    self.refresh_within(
                        &info,
                        self.call_timeout.min(remaining.max(Duration::from_millis(1))),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match observed {
                Ok(info) => match info.state {
                    ContainerState::Running => {
                        info!(parent: &self.span, id = %id, attempt, "Container is running");
                        return Ok(info);
                    }
                    ContainerState::Exited if info.one_shot => {
                        info!(parent: &self.span, id = %id, "One-shot container completed");
                        return self
                            .update(id, |c| {
                                c.message = Some("Container completed successfully".to_string())
                            })
                            .await;
                    }
                    ContainerState::Error | ContainerState::Exited => {
                        let reason = info
                            .message
                            .clone()
                            .unwrap_or_else(|| "Container exited during start".to_string());
                        self.mark_error(id, &reason).await;
                        return Err(ContainerError::StartFailed {
                            id: id.to_string(),
                            reason,
                        });
                    }
                    _ => {
                        debug!(parent: &self.span, id = %id, attempt, state = %info.state, "Waiting for container");
                    }
                },
                Err(ContainerError::NotFound(missing)) => {
                    return Err(ContainerError::NotFound(missing));
                }
                Err(e) => {
                    warn!(parent: &self.span, id = %id, attempt, error = %e, "Status check failed while waiting");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.lifecycle.poll_interval().min(remaining)).await;
        }

        let message = format!("Container start timeout after {:?}", timeout);
        self.mark_error(id, &message).await;
        Err(ContainerError::Timeout {
            id: id.to_string(),
            waited: timeout,
        })
    }

    async fn ensure_image(
        &self,
        image: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), ContainerError> {
        match self
            .call("inspect_image", self.runtime.inspect_image(image))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(parent: &self.span, image = %image, "Image not present locally, pulling");
                self.pull_with_progress(image, progress).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_with_progress(
        &self,
        image: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), ContainerError> {
        let report = |status: String, percent: Option<f64>, error: Option<String>| {
            if let Some(callback) = progress {
                callback(ImagePullProgress {
                    image: image.to_string(),
                    status,
                    progress: percent,
                    error,
                });
            }
        };
        let fail = |raw: String| {
            let message = classify_pull_error(&raw, image);
            warn!(parent: &self.span, image = %image, error = %raw, "Image pull failed");
            report("Pull failed".to_string(), None, Some(message.clone()));
            metrics::record_image_pull(false);
            ContainerError::ImagePull {
                image: image.to_string(),
                message,
            }
        };

        report(format!("Pulling {}", image), Some(0.0), None);
        let mut stream = self.runtime.pull_image(image);

        loop {
            // The deadline applies between records; large layers may take long overall
            let next = match tokio::time::timeout(self.call_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(fail(format!(
                        "timeout: no progress from registry for {:?}",
                        self.call_timeout
                    )))
                }
            };

            match next {
                None => break,
                Some(Ok(record)) => {
                    if let Some(raw) = record.error {
                        return Err(fail(raw));
                    }
                    let percent = record.progress_detail.as_ref().and_then(|d| {
                        match (d.current, d.total) {
                            (Some(current), Some(total)) if total > 0 => {
                                Some((current as f64 / total as f64 * 100.0).min(100.0))
                            }
                            _ => None,
                        }
                    });
                    let status = match record.id {
                        Some(layer) => format!(
                            "{}: {}",
                            layer,
                            record.status.unwrap_or_default()
                        ),
                        None => record.status.unwrap_or_default(),
                    };
                    report(status, percent, None);
                }
                Some(Err(e)) => return Err(fail(e.to_string())),
            }
        }

        report("Image ready".to_string(), Some(100.0), None);
        metrics::record_image_pull(true);
        info!(parent: &self.span, image = %image, "Image pulled");
        Ok(())
    }
}

fn validate_image(image: &str) -> Result<(), ContainerError> {
    if image.trim().is_empty() {
        return Err(ContainerError::Validation("image is required".to_string()));
    }
    if image.chars().any(char::is_whitespace) {
        return Err(ContainerError::Validation(format!(
            "invalid image reference {:?}",
            image
        )));
    }
    Ok(())
}

fn validate(lesson_id: &str, config: &ContainerConfig) -> Result<(), ContainerError> {
    if lesson_id.trim().is_empty() {
        return Err(ContainerError::Validation("lesson id is required".to_string()));
    }
    validate_image(&config.image)?;

    if config.memory_limit <= 0 {
        return Err(ContainerError::Validation(
            "memory limit must be positive".to_string(),
        ));
    }
    if !(config.cpu_limit.is_finite() && config.cpu_limit > 0.0) {
        return Err(ContainerError::Validation(
            "cpu limit must be positive".to_string(),
        ));
    }
    if let Some((host, container)) = config.ports.iter().find(|(h, c)| **h == 0 || **c == 0) {
        return Err(ContainerError::Validation(format!(
            "invalid port mapping {}:{}",
            host, container
        )));
    }
    if let Some(path) = config.volumes.values().find(|p| !p.starts_with('/')) {
        return Err(ContainerError::Validation(format!(
            "volume target {} must be an absolute path",
            path
        )));
    }
    Ok(())
}

/// `<prefix>-<lesson>-<unix millis>-<short uuid>`, restricted to characters the runtime accepts
fn container_name(prefix: &str, lesson_id: &str) -> String {
    let lesson: String = lesson_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}-{}",
        prefix,
        lesson,
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

/// Translate a request into runtime create parameters with hard resource limits
fn runtime_config(lesson_id: &str, config: &ContainerConfig) -> Config<String> {
    let mut env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (host, container) in &config.ports {
        let key = format!("{}/tcp", container);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host.to_string()),
            });
    }

    let binds: Vec<String> = config
        .volumes
        .iter()
        .map(|(host, container)| format!("{}:{}", host, container))
        .collect();

    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(LESSON_LABEL.to_string(), lesson_id.to_string());

    let cpu_period = 100_000i64;
    let host_config = HostConfig {
        memory: Some(config.memory_limit),
        memory_swap: Some(config.memory_limit),
        cpu_period: Some(cpu_period),
        cpu_quota: Some((config.cpu_limit * cpu_period as f64).round() as i64),
        port_bindings: Some(port_bindings),
        binds: if binds.is_empty() { None } else { Some(binds) },
        privileged: Some(config.privileged),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        env: Some(env),
        cmd: if config.cmd.is_empty() {
            None
        } else {
            Some(config.cmd.clone())
        },
        working_dir: config.working_dir.clone(),
        exposed_ports: Some(exposed_ports),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn failure_message(state: &RuntimeState) -> String {
    if state.oom_killed.unwrap_or(false) {
        return "Container was killed: out of memory".to_string();
    }
    let exit_code = state.exit_code.unwrap_or(0);
    match state.error.as_deref().filter(|e| !e.is_empty()) {
        Some(error) => format!("Container failed: exit code {}, {}", exit_code, error),
        None if state.dead.unwrap_or(false) => {
            format!("Container is dead: exit code {}", exit_code)
        }
        None => format!("Container failed: exit code {}", exit_code),
    }
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Fold a runtime inspection into a registry entry.
///
/// The runtime only overrides the registry when its answer is definitive:
/// running, dead, OOM-killed, a non-zero exit of an active container, or a
/// clean exit of a container that was running (or is one-shot).
fn reconcile(info: &mut ContainerInfo, inspect: &ContainerInspectResponse) {
    let Some(state) = inspect.state.as_ref() else {
        return;
    };
    let running = state.running.unwrap_or(false);
    let exit_code = state.exit_code.unwrap_or(0);
    let exited = matches!(state.status, Some(ContainerStateStatusEnum::EXITED));

    if running {
        if info.state != ContainerState::Running {
            info.started_at = parse_time(state.started_at.as_ref()).or_else(|| Some(Utc::now()));
        }
        info.state = ContainerState::Running;
        info.exit_code = None;
        info.message = None;
        return;
    }

    if !info.state.is_active() {
        return;
    }

    if state.dead.unwrap_or(false) || state.oom_killed.unwrap_or(false) || exit_code != 0 {
        info.state = ContainerState::Error;
        info.exit_code = Some(exit_code);
        info.message = Some(failure_message(state));
    } else if exited && (info.state == ContainerState::Running || info.one_shot) {
        info.state = ContainerState::Exited;
        info.exit_code = Some(0);
        info.message = Some("Container exited".to_string());
    }
}

/// Rebuild a registry entry for a container found in the runtime
fn recovered_info(
    lesson_id: &str,
    container_id: &str,
    inspect: &ContainerInspectResponse,
) -> ContainerInfo {
    let runtime_state = inspect.state.as_ref();
    let running = runtime_state.and_then(|s| s.running).unwrap_or(false);
    let failed = runtime_state
        .map(|s| s.dead.unwrap_or(false) || s.oom_killed.unwrap_or(false))
        .unwrap_or(false);
    let state = if running {
        ContainerState::Running
    } else if failed {
        ContainerState::Error
    } else {
        ContainerState::Stopped
    };

    let env = inspect
        .config
        .as_ref()
        .and_then(|c| c.env.as_ref())
        .map(|vars| {
            vars.iter()
                .filter_map(|v| v.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let ports = inspect
        .host_config
        .as_ref()
        .and_then(|h| h.port_bindings.as_ref())
        .map(|bindings| {
            let mut ports = HashMap::new();
            for (key, hosts) in bindings {
                let Some(container) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
                else {
                    continue;
                };
                for binding in hosts.iter().flatten() {
                    if let Some(host) = binding.host_port.as_ref().and_then(|p| p.parse().ok()) {
                        ports.insert(host, container);
                    }
                }
            }
            ports
        })
        .unwrap_or_default();

    ContainerInfo {
        id: Uuid::new_v4().to_string(),
        lesson_id: lesson_id.to_string(),
        container_id: container_id.to_string(),
        name: inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| container_id.to_string()),
        state,
        image: inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        created_at: parse_time(inspect.created.as_ref()).unwrap_or_else(Utc::now),
        started_at: if running {
            parse_time(runtime_state.and_then(|s| s.started_at.as_ref()))
        } else {
            None
        },
        exit_code: runtime_state.and_then(|s| s.exit_code).filter(|_| !running),
        message: if failed {
            runtime_state.map(failure_message)
        } else {
            None
        },
        env,
        ports,
        one_shot: false,
    }
}

/// Map a raw pull failure to a message a learner can act on
pub fn classify_pull_error(raw: &str, image: &str) -> String {
    let lower = raw.to_lowercase();

    if contains_any(&lower, &["timeout", "connection refused", "no such host", "network", "dial tcp", "connection reset"]) {
        format!("Network error while pulling {}; check the connection to the registry", image)
    } else if contains_any(&lower, &["unauthorized", "authentication", "denied", "forbidden"]) {
        format!("Not authorized to pull {}; log in to the registry first", image)
    } else if contains_any(&lower, &["not found", "manifest unknown", "does not exist", "no such image"]) {
        format!("Image {} was not found in the registry", image)
    } else if contains_any(&lower, &["no space left", "disk"]) {
        format!("Not enough disk space to pull {}", image)
    } else if contains_any(&lower, &["daemon", "cannot connect to the docker", "is the docker daemon running"]) {
        format!("The container runtime is not responding while pulling {}", image)
    } else if contains_any(&lower, &["500", "502", "503", "internal server error", "bad gateway", "service unavailable"]) {
        format!("The registry failed while serving {}; try again later", image)
    } else {
        format!("Failed to pull {}: {}", image, raw)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn cleanup_result(cleaned: Vec<String>, failed: usize, scope: &str) -> CleanupResult {
    let message = if failed == 0 {
        format!("Removed {} container(s) {}", cleaned.len(), scope)
    } else {
        format!(
            "Removed {} container(s) {}, {} could not be removed",
            cleaned.len(),
            scope,
            failed
        )
    };
    CleanupResult {
        success: failed == 0,
        message,
        cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{InMemoryRuntime, MockContainerRuntime, ScriptedBehavior};
    use bollard::models::ImageInspect;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    const IMAGE: &str = "kwdb:latest";

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.lifecycle.poll_interval_ms = 10;
        config.lifecycle.start_timeout_secs = 1;
        config.lifecycle.restart_timeout_secs = 1;
        config.lifecycle.status_cache_ttl_secs = 60;
        config.runtime.call_timeout_secs = 2;
        config
    }

    fn lesson_config() -> ContainerConfig {
        let mut ports = HashMap::new();
        ports.insert(26257, 26257);
        ContainerConfig {
            image: IMAGE.to_string(),
            ports,
            memory_limit: 512 * 1024 * 1024,
            cpu_limit: 1.0,
            ..Default::default()
        }
    }

    fn controller_with(runtime: &InMemoryRuntime, config: &AppConfig) -> ContainerController {
        ContainerController::new(Arc::new(runtime.clone()), config, Span::none())
    }

    fn setup() -> (InMemoryRuntime, ContainerController) {
        let runtime = InMemoryRuntime::new();
        runtime.add_image(IMAGE);
        let controller = controller_with(&runtime, &test_config());
        (runtime, controller)
    }

    #[tokio::test]
    async fn test_create_then_start_reaches_running() {
        let (runtime, controller) = setup();

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        assert_eq!(created.state, ContainerState::Creating);
        assert!(created.name.starts_with("playground-l1-"));

        let started = controller.start_container(&created.id).await.unwrap();
        assert_eq!(started.state, ContainerState::Running);
        assert!(started.started_at.is_some());
        assert!(controller.is_container_running(&created.id).await.unwrap());

        let configs = runtime.created_configs();
        assert_eq!(configs.len(), 1);
        let host = configs[0].1.host_config.clone().unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(100_000));
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["26257/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("26257"));
        let labels = configs[0].1.labels.clone().unwrap();
        assert_eq!(labels.get(LESSON_LABEL).map(String::as_str), Some("L1"));
    }

    #[tokio::test]
    async fn test_start_reports_error_on_nonzero_exit() {
        let (runtime, controller) = setup();
        runtime.set_behavior(IMAGE, ScriptedBehavior::ExitsWith(1));

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        let err = controller.start_container(&created.id).await.unwrap_err();
        assert!(matches!(err, ContainerError::StartFailed { .. }));

        let info = controller.get_container(&created.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Error);
        assert_eq!(info.exit_code, Some(1));
        assert!(!info.message.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_bounded_when_container_never_runs() {
        let (runtime, controller) = setup();
        runtime.set_behavior(IMAGE, ScriptedBehavior::NeverRuns);

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        let began = Instant::now();
        let err = controller.start_container(&created.id).await.unwrap_err();

        assert!(matches!(err, ContainerError::Timeout { .. }));
        assert!(began.elapsed() < Duration::from_secs(3));
        let info = controller.get_container(&created.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Error);
        assert!(info.message.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_slow_start_call_counts_against_start_timeout() {
        let (runtime, controller) = setup();
        runtime.set_behavior(IMAGE, ScriptedBehavior::NeverRuns);
        runtime.set_start_delay(Duration::from_millis(700));

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        let began = Instant::now();
        let err = controller.start_container(&created.id).await.unwrap_err();

        assert!(matches!(err, ContainerError::Timeout { .. }));
        let elapsed = began.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_start_failure_from_runtime_marks_error() {
        let (runtime, controller) = setup();
        runtime.set_behavior(
            IMAGE,
            ScriptedBehavior::FailsToStart("port is already allocated".to_string()),
        );

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        let err = controller.start_container(&created.id).await.unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));

        let info = controller.get_container(&created.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Error);
    }

    #[tokio::test]
    async fn test_one_shot_clean_exit_counts_as_started() {
        let (runtime, controller) = setup();
        runtime.set_behavior(IMAGE, ScriptedBehavior::ExitsWith(0));

        let config = ContainerConfig {
            one_shot: true,
            ..lesson_config()
        };
        let created = controller.create_container("L1", config).await.unwrap();
        let info = controller.start_container(&created.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_concurrent_creates_keep_one_container_per_lesson() {
        let (runtime, controller) = setup();
        runtime.set_create_delay(Duration::from_millis(20));
        let controller = Arc::new(controller);

        let attempts = (0..5).map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.create_container("L1", lesson_config()).await })
        });
        for result in futures::future::join_all(attempts).await {
            result.unwrap().unwrap();
        }

        let active: Vec<_> = controller
            .lesson_containers("L1")
            .await
            .into_iter()
            .filter(|c| c.state.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_previous_lesson_container() {
        let (runtime, controller) = setup();

        let first = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&first.id).await.unwrap();
        let second = controller.create_container("L1", lesson_config()).await.unwrap();

        assert!(matches!(
            controller.get_container(&first.id).await,
            Err(ContainerError::NotFound(_))
        ));
        assert_eq!(controller.get_container(&second.id).await.unwrap().id, second.id);
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn test_lessons_do_not_replace_each_other() {
        let (runtime, controller) = setup();

        controller.create_container("L1", lesson_config()).await.unwrap();
        let mut other = lesson_config();
        other.ports = HashMap::from([(26258, 26257)]);
        controller.create_container("L2", other).await.unwrap();

        assert_eq!(controller.tracked_count().await, 2);
        assert_eq!(runtime.container_count(), 2);
    }

    #[tokio::test]
    async fn test_validation_happens_before_runtime_calls() {
        // No expectations: any runtime call would panic
        let runtime = MockContainerRuntime::new();
        let controller = ContainerController::new(Arc::new(runtime), &test_config(), Span::none());

        let mut config = lesson_config();
        config.image = String::new();
        assert!(matches!(
            controller.create_container("L1", config).await,
            Err(ContainerError::Validation(_))
        ));

        let mut config = lesson_config();
        config.memory_limit = 0;
        assert!(matches!(
            controller.create_container("L1", config).await,
            Err(ContainerError::Validation(_))
        ));

        let mut config = lesson_config();
        config.cpu_limit = -1.0;
        assert!(matches!(
            controller.create_container("L1", config).await,
            Err(ContainerError::Validation(_))
        ));

        assert!(matches!(
            controller.resize_terminal("exec", 0, 80).await,
            Err(ContainerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_entry() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect_image()
            .returning(|_| Ok(ImageInspect::default()));
        runtime.expect_create_container().returning(|_, _| {
            Err(DockerError::DockerResponseServerError {
                status_code: 500,
                message: "no space left on device".to_string(),
            })
        });
        let controller = ContainerController::new(Arc::new(runtime), &test_config(), Span::none());

        let err = controller
            .create_container("L1", lesson_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Runtime(_)));
        assert_eq!(controller.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_runtime_timeout_surfaces_as_error() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect_image().returning(|_| {
            Err(DockerError::RequestTimeoutError)
        });
        let controller = ContainerController::new(Arc::new(runtime), &test_config(), Span::none());

        let err = controller
            .create_container("L1", lesson_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_stop_is_visible_immediately() {
        let (_runtime, controller) = setup();

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();
        assert_eq!(
            controller.get_container(&created.id).await.unwrap().state,
            ContainerState::Running
        );

        controller.stop_container(&created.id).await.unwrap();
        assert_eq!(
            controller.get_container(&created.id).await.unwrap().state,
            ContainerState::Stopped
        );

        // Stopping again is not an error
        controller.stop_container(&created.id).await.unwrap();

        let restarted = controller.restart_container(&created.id).await.unwrap();
        assert_eq!(restarted.state, ContainerState::Running);
        assert_eq!(
            controller.get_container(&created.id).await.unwrap().state,
            ContainerState::Running
        );
    }

    #[tokio::test]
    async fn test_get_container_serves_from_cache() {
        let (runtime, controller) = setup();

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();
        let calls = runtime.inspect_calls();

        controller.get_container(&created.id).await.unwrap();
        controller.get_container(&created.container_id).await.unwrap();
        assert_eq!(runtime.inspect_calls(), calls);
    }

    #[tokio::test]
    async fn test_get_container_reconciles_crash() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image(IMAGE);
        let mut config = test_config();
        config.lifecycle.status_cache_ttl_secs = 0;
        let controller = controller_with(&runtime, &config);

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();
        runtime.set_exited(&created.container_id, 137);

        let info = controller.get_container(&created.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Error);
        assert_eq!(info.exit_code, Some(137));
    }

    #[tokio::test]
    async fn test_clean_exit_of_running_container_is_exited() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image(IMAGE);
        let mut config = test_config();
        config.lifecycle.status_cache_ttl_secs = 0;
        let controller = controller_with(&runtime, &config);

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();
        runtime.set_exited(&created.container_id, 0);

        let info = controller.get_container(&created.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_list_marks_vanished_containers() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image(IMAGE);
        let mut config = test_config();
        config.lifecycle.status_cache_ttl_secs = 0;
        let controller = controller_with(&runtime, &config);

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        runtime.remove_externally(&created.container_id);

        let listed = controller.list_containers().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, ContainerState::Error);
        assert!(listed[0].message.as_ref().unwrap().contains("removed"));
    }

    #[tokio::test]
    async fn test_unknown_container_is_not_found() {
        let (_runtime, controller) = setup();

        assert!(matches!(
            controller.stop_container("missing").await,
            Err(ContainerError::NotFound(_))
        ));
        assert!(matches!(
            controller.get_container_logs("missing", None).await,
            Err(ContainerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_forgets_container() {
        let (runtime, controller) = setup();

        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();
        controller.remove_container(&created.id).await.unwrap();

        assert_eq!(controller.tracked_count().await, 0);
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled_with_progress() {
        let runtime = InMemoryRuntime::new();
        let controller = controller_with(&runtime, &test_config());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p: ImagePullProgress| sink.lock().unwrap().push(p));

        controller
            .create_container_with_progress("L1", lesson_config(), Some(callback))
            .await
            .unwrap();

        assert!(runtime.has_image(IMAGE));
        let seen = seen.lock().unwrap();
        assert!(seen.len() > 2);
        let last = seen.last().unwrap();
        assert_eq!(last.status, "Image ready");
        assert_eq!(last.progress, Some(100.0));
        assert!(seen.iter().all(|p| p.error.is_none()));
    }

    #[tokio::test]
    async fn test_pull_failure_is_classified() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_pull("ghost:1", "manifest unknown");
        let controller = controller_with(&runtime, &test_config());

        let mut config = lesson_config();
        config.image = "ghost:1".to_string();
        let err = controller.create_container("L1", config).await.unwrap_err();
        match err {
            ContainerError::ImagePull { message, .. } => {
                assert!(message.contains("not found"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(controller.tracked_count().await, 0);
    }

    #[test]
    fn test_classify_pull_error() {
        assert!(classify_pull_error("dial tcp: i/o timeout", "a").starts_with("Network"));
        assert!(classify_pull_error("unauthorized: authentication required", "a").contains("authorized"));
        assert!(classify_pull_error("write /var/lib: no space left on device", "a").contains("disk"));
        assert!(classify_pull_error("received unexpected HTTP status: 503", "a").contains("registry"));
        assert_eq!(classify_pull_error("boom", "a"), "Failed to pull a: boom");
    }

    #[tokio::test]
    async fn test_exec_command_captures_output() {
        let (_runtime, controller) = setup();
        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();

        let output = controller
            .exec_command(&created.id, vec!["echo".to_string(), "hello".to_string()])
            .await
            .unwrap();
        assert_eq!(output, "hello\n");

        let err = controller
            .exec_command(&created.id, vec!["false".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::ExecFailed { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_port_conflict_detection() {
        let (runtime, controller) = setup();
        let labels = HashMap::from([(LESSON_LABEL.to_string(), "L2".to_string())]);
        runtime.insert_external_container("other-db", "postgres:16", labels, vec![5432], true);

        let conflict = controller.check_port_conflict("L1", 5432).await.unwrap();
        assert!(conflict.has_conflict);
        assert!(!conflict.is_lesson_container);
        let holder = conflict.conflict_container.unwrap();
        assert_eq!(holder.name, "other-db");
        assert_eq!(holder.lesson_id.as_deref(), Some("L2"));

        let same = controller.check_port_conflict("L2", 5432).await.unwrap();
        assert!(same.is_lesson_container);

        let free = controller.check_port_conflict("L1", 5433).await.unwrap();
        assert!(!free.has_conflict);

        assert!(matches!(
            controller.check_port_conflict("L1", 70000).await,
            Err(ContainerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_lesson_removes_registered_and_orphaned() {
        let (runtime, controller) = setup();
        controller.create_container("L1", lesson_config()).await.unwrap();
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (LESSON_LABEL.to_string(), "L1".to_string()),
        ]);
        runtime.insert_external_container("stale", IMAGE, labels, vec![], false);

        let result = controller.cleanup_lesson_containers("L1").await.unwrap();
        assert!(result.success);
        assert_eq!(result.cleaned.len(), 2);
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(controller.tracked_count().await, 0);
        assert!(controller.lesson_locks.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_lock_someone_still_holds() {
        let (_runtime, controller) = setup();
        controller.create_container("L1", lesson_config()).await.unwrap();
        let held = controller.lesson_lock("L1").await;

        controller.cleanup_lesson_containers("L1").await.unwrap();
        assert!(controller.lesson_locks.read().await.contains_key("L1"));

        drop(held);
        controller.cleanup_lesson_containers("L1").await.unwrap();
        assert!(controller.lesson_locks.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_drops_expired_cache_entries() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image(IMAGE);
        let mut config = test_config();
        config.lifecycle.status_cache_ttl_secs = 0;
        let controller = controller_with(&runtime, &config);

        controller.create_container("L1", lesson_config()).await.unwrap();
        controller.create_container("L2", lesson_config()).await.unwrap();
        assert_eq!(controller.cache.len().await, 2);

        assert_eq!(controller.list_containers().await.len(), 2);
        assert_eq!(controller.cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_all_containers() {
        let (runtime, controller) = setup();
        controller.create_container("L1", lesson_config()).await.unwrap();
        let mut other = lesson_config();
        other.ports.clear();
        controller.create_container("L2", other).await.unwrap();
        runtime.insert_external_container("unmanaged", IMAGE, HashMap::new(), vec![], true);

        let result = controller.cleanup_all_containers().await.unwrap();
        assert!(result.success);
        assert_eq!(result.cleaned.len(), 2);
        // Containers without the managed label are left alone
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn test_load_existing_recovers_labeled_containers() {
        let runtime = InMemoryRuntime::new();
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (LESSON_LABEL.to_string(), "L7".to_string()),
        ]);
        let container_id =
            runtime.insert_external_container("playground-l7-1-abc", IMAGE, labels, vec![], true);
        runtime.insert_external_container("unrelated", IMAGE, HashMap::new(), vec![], true);

        let controller = controller_with(&runtime, &test_config());
        assert_eq!(controller.load_existing().await.unwrap(), 1);

        let info = controller.get_container(&container_id).await.unwrap();
        assert_eq!(info.lesson_id, "L7");
        assert_eq!(info.state, ContainerState::Running);
        assert_eq!(info.name, "playground-l7-1-abc");
    }

    #[tokio::test]
    async fn test_logs_respect_tail() {
        let (runtime, controller) = setup();
        let created = controller.create_container("L1", lesson_config()).await.unwrap();
        controller.start_container(&created.id).await.unwrap();
        runtime.push_log(&created.container_id, "first");
        runtime.push_log(&created.container_id, "second");

        let logs = controller
            .get_container_logs(&created.id, Some(1))
            .await
            .unwrap();
        assert_eq!(logs, "second\n");
    }
}
