//! Docker collector: container listing and log following.

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions},
    errors::Error as BollardError,
    models::ContainerSummary as DockerContainer,
};
use bytes::Bytes;
use corelink_core::traits::{LogChunkStream, LogSource, LogSourceError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

/// Default Docker endpoint.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Request timeout for the Docker API, in seconds.
const DOCKER_TIMEOUT_SECS: u64 = 10;

/// Length of the short container id.
const SHORT_ID_LEN: usize = 12;

/// One container as shown in the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub created: String,
}

impl ContainerSummary {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

impl From<DockerContainer> for ContainerSummary {
    fn from(c: DockerContainer) -> Self {
        let mut id = c.id.unwrap_or_default();
        id.truncate(SHORT_ID_LEN);
        let name = c
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        Self {
            id,
            name,
            status: c.state.unwrap_or_else(|| "unknown".to_string()),
            image: c
                .image
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            created: c.created.map(|t| t.to_string()).unwrap_or_default(),
        }
    }
}

/// Docker API client. Stays usable when the daemon is unreachable: listing
/// returns nothing and log follows report the source as unavailable.
#[derive(Debug, Clone)]
pub struct DockerCollector {
    docker: Option<Docker>,
}

impl DockerCollector {
    /// Connect to the daemon at `socket`.
    #[must_use]
    pub fn connect(socket: &str) -> Self {
        match Docker::connect_with_socket(socket, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION) {
            Ok(docker) => Self {
                docker: Some(docker),
            },
            Err(e) => {
                tracing::warn!(socket, "Docker unavailable: {e}");
                Self::unavailable()
            }
        }
    }

    /// Collector with no daemon behind it.
    #[must_use]
    pub const fn unavailable() -> Self {
        Self { docker: None }
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.docker.is_some()
    }

    fn client(&self) -> Result<&Docker, CollectorError> {
        self.docker.as_ref().ok_or(CollectorError::DockerUnavailable)
    }

    /// All containers, running or not, optionally filtered by a name
    /// substring.
    ///
    /// # Errors
    /// Returns error if the daemon is unavailable or the request fails.
    pub async fn list_containers(
        &self,
        pattern: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, CollectorError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.client()?.list_containers(Some(options)).await?;
        Ok(filter_by_name(
            containers.into_iter().map(ContainerSummary::from),
            pattern,
        ))
    }
}

fn filter_by_name(
    containers: impl Iterator<Item = ContainerSummary>,
    pattern: Option<&str>,
) -> Vec<ContainerSummary> {
    containers
        .filter(|c| pattern.is_none_or(|p| p.is_empty() || c.name.contains(p)))
        .collect()
}

fn log_bytes(output: LogOutput) -> Bytes {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

#[async_trait]
impl LogSource for DockerCollector {
    async fn follow(&self, container: &str, tail: usize) -> Result<LogChunkStream, LogSourceError> {
        let docker = self
            .client()
            .map_err(|e| LogSourceError::Unavailable(e.to_string()))?;

        docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => LogSourceError::NotFound(container.to_string()),
                other => LogSourceError::Unavailable(other.to_string()),
            })?;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        tracing::debug!(container, tail, "Following container logs");

        Ok(docker
            .logs(container, Some(options))
            .map(|item| item.map(log_bytes).map_err(|e| LogSourceError::Stream(e.to_string())))
            .boxed())
    }
}
