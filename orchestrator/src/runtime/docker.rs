//! bollard-backed runtime adapter

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, ExecInspectResponse,
    ImageInspect,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use tracing::{debug, info, warn};

use super::{ContainerRuntime, LogStream, PullStream, RuntimeError};
use crate::config::RuntimeConfig;

/// Container runtime reached over the Docker Engine API
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
}

/// Endpoints to try, in order, when connecting to the runtime.
///
/// Duplicates are dropped so an endpoint named both in the config and in
/// `DOCKER_HOST` is only pinged once.
pub fn candidate_endpoints(config: &RuntimeConfig) -> Vec<String> {
    let mut candidates = Vec::new();

    if let Some(host) = config.host.as_ref().filter(|h| !h.trim().is_empty()) {
        candidates.push(host.clone());
    }
    if let Ok(host) = std::env::var("DOCKER_HOST") {
        if !host.trim().is_empty() {
            candidates.push(host);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(format!("unix://{}/.docker/run/docker.sock", home));
    }
    candidates.push("unix:///var/run/docker.sock".to_string());
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        candidates.push(format!("unix://{}/podman/podman.sock", runtime_dir));
    }
    candidates.push("unix:///run/podman/podman.sock".to_string());
    for path in &config.socket_paths {
        if path.contains("://") {
            candidates.push(path.clone());
        } else {
            candidates.push(format!("unix://{}", path));
        }
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
    candidates
}

impl DockerRuntime {
    /// Connect to the first candidate endpoint that answers a ping.
    ///
    /// Unix sockets that do not exist on disk are skipped without a ping.
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let candidates = candidate_endpoints(config);
        let timeout = config.connect_timeout();

        for endpoint in &candidates {
            if let Some(path) = endpoint.strip_prefix("unix://") {
                if !Path::new(path).exists() {
                    debug!(endpoint = %endpoint, "Skipping missing runtime socket");
                    continue;
                }
            }

            let docker = match open(endpoint, config.call_timeout()) {
                Ok(docker) => docker,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Failed to open runtime endpoint");
                    continue;
                }
            };

            match tokio::time::timeout(timeout, docker.ping()).await {
                Ok(Ok(_)) => {
                    info!(endpoint = %endpoint, "Connected to container runtime");
                    return Ok(Self {
                        docker,
                        endpoint: endpoint.clone(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "Runtime endpoint did not answer ping");
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, timeout = ?timeout, "Runtime endpoint ping timed out");
                }
            }
        }

        Err(RuntimeError::Unavailable {
            tried: candidates.join(", "),
        })
    }
}

fn open(endpoint: &str, call_timeout: Duration) -> Result<Docker, DockerError> {
    let secs = call_timeout.as_secs().max(1);

    if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
        return Docker::connect_with_http(endpoint, secs, API_DEFAULT_VERSION);
    }

    #[cfg(unix)]
    {
        Docker::connect_with_unix(endpoint, secs, API_DEFAULT_VERSION)
    }

    #[cfg(windows)]
    {
        Docker::connect_with_named_pipe(endpoint, secs, API_DEFAULT_VERSION)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map(|_| ())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        self.docker.create_container(Some(options), config).await
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), DockerError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as _,
        };
        self.docker.stop_container(id, Some(options)).await
    }

    async fn restart_container(&self, id: &str, grace: Duration) -> Result<(), DockerError> {
        let options = RestartContainerOptions {
            t: grace.as_secs() as _,
        };
        self.docker.restart_container(id, Some(options)).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
    }

    async fn list_containers(
        &self,
        label: Option<String>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        let mut filters = HashMap::new();
        if let Some(label) = label {
            filters.insert("label".to_string(), vec![label]);
        }
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        self.docker.list_containers(Some(options)).await
    }

    fn logs(&self, id: &str, tail: Option<usize>, follow: bool) -> LogStream {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            timestamps: false,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        Box::pin(self.docker.logs(id, Some(options)))
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInspect, DockerError> {
        self.docker.inspect_image(image).await
    }

    fn pull_image(&self, image: &str) -> PullStream {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        Box::pin(self.docker.create_image(Some(options), None, None))
    }

    async fn create_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String, DockerError> {
        self.docker
            .create_exec(container_id, options)
            .await
            .map(|created| created.id)
    }

    async fn start_exec(
        &self,
        exec_id: &str,
        options: StartExecOptions,
    ) -> Result<StartExecResults, DockerError> {
        self.docker.start_exec(exec_id, Some(options)).await
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), DockerError> {
        let options = ResizeExecOptions {
            height: rows,
            width: cols,
        };
        self.docker.resize_exec(exec_id, options).await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse, DockerError> {
        self.docker.inspect_exec(exec_id).await
    }
}
