//! Container runtime boundary
//!
//! The lifecycle controller and the terminal manager only reach the container
//! engine through [`ContainerRuntime`]. Two implementations exist:
//! - [`DockerRuntime`], the bollard adapter used in production
//! - [`InMemoryRuntime`], a deterministic stand-in used by the tests
//!
//! Every call made by the core goes through [`with_timeout`] so a stalled
//! engine turns into a [`RuntimeError::Timeout`] instead of a hung request.

mod docker;
mod memory;

pub use docker::{candidate_endpoints, DockerRuntime};
pub use memory::{InMemoryRuntime, ScriptedBehavior};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{Config, LogOutput};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, CreateImageInfo,
    ExecInspectResponse, ImageInspect,
};
use futures::Stream;
use thiserror::Error;

/// Stream of log frames produced by a container
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;

/// Stream of progress records produced by an image pull
pub type PullStream = Pin<Box<dyn Stream<Item = Result<CreateImageInfo, DockerError>> + Send>>;

/// Operations the core needs from a container engine.
///
/// Request and response shapes are bollard's so the adapter stays a thin
/// pass-through. `start_exec` both attaches to and
/// starts the exec instance when `options.detach` is false, returning its
/// output stream and input writer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable endpoint this runtime is connected to
    fn endpoint(&self) -> String;

    async fn ping(&self) -> Result<(), DockerError>;

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;

    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), DockerError>;

    async fn restart_container(&self, id: &str, grace: Duration) -> Result<(), DockerError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError>;

    /// List all containers (running or not), optionally filtered by a `key=value` label
    async fn list_containers(
        &self,
        label: Option<String>,
    ) -> Result<Vec<ContainerSummary>, DockerError>;

    fn logs(&self, id: &str, tail: Option<usize>, follow: bool) -> LogStream;

    async fn inspect_image(&self, image: &str) -> Result<ImageInspect, DockerError>;

    fn pull_image(&self, image: &str) -> PullStream;

    /// Create an exec instance and return its id
    async fn create_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String, DockerError>;

    async fn start_exec(
        &self,
        exec_id: &str,
        options: StartExecOptions,
    ) -> Result<StartExecResults, DockerError>;

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), DockerError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse, DockerError>;
}

/// Errors surfaced by runtime calls
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no container runtime reachable (tried: {tried})")]
    Unavailable { tried: String },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{op} failed: {source}")]
    Api {
        op: &'static str,
        #[source]
        source: DockerError,
    },
}

impl RuntimeError {
    /// HTTP status reported by the engine, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RuntimeError::Api {
                source: DockerError::DockerResponseServerError { status_code, .. },
                ..
            } => Some(*status_code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// The engine answered 304: the container was already in the requested state
    pub fn is_not_modified(&self) -> bool {
        self.status_code() == Some(304)
    }
}

/// Run a runtime call under a deadline
pub async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, DockerError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(RuntimeError::Api { op, source }),
        Err(_) => Err(RuntimeError::Timeout { op, timeout }),
    }
}

/// Build the error the engine returns for an unknown object
pub(crate) fn not_found(what: &str, id: &str) -> DockerError {
    DockerError::DockerResponseServerError {
        status_code: 404,
        message: format!("No such {}: {}", what, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_api_errors() {
        let result: Result<(), RuntimeError> =
            with_timeout("inspect", Duration::from_secs(1), async {
                Err(not_found("container", "abc"))
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("inspect failed"));
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), RuntimeError> =
            with_timeout("start", Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(RuntimeError::Timeout { op: "start", .. })
        ));
    }
}
