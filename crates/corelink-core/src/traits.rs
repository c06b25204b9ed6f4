//! Collaborator traits injected into the streaming core.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use crate::snapshot::{SampleKind, SampleSnapshot};

/// Channel identifier.
pub type ChannelId = Uuid;

/// Execution session identifier.
pub type SessionId = Uuid;

/// Spawned process handle.
pub struct SpawnedProcess {
    /// Child process group, stdout and stderr piped.
    pub child: command_group::AsyncGroupChild,
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Spawns a shell command into the configured execution context.
///
/// The execution boundary (host namespaces or local shell) lives entirely
/// behind this trait so sessions can be driven by a mock in tests.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Spawn `command` with stdout and stderr piped.
    async fn spawn(&self, command: &str) -> Result<SpawnedProcess, ExecutorError>;
}

/// Stream of raw log chunks; chunk boundaries need not align with lines.
pub type LogChunkStream = BoxStream<'static, Result<Bytes, LogSourceError>>;

/// Log source error.
#[derive(Debug, Clone, Error)]
pub enum LogSourceError {
    #[error("Container '{0}' not found")]
    NotFound(String),
    #[error("Log source unavailable: {0}")]
    Unavailable(String),
    #[error("Log stream interrupted: {0}")]
    Stream(String),
}

/// Source of container log streams.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Follow a container's logs, starting with the last `tail` lines.
    ///
    /// Dropping the returned stream releases the underlying follow handle.
    async fn follow(&self, container: &str, tail: usize) -> Result<LogChunkStream, LogSourceError>;
}

/// Sample gathering error.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Sample source unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to parse sample: {0}")]
    Parse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of periodic samples.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Sample type this source produces.
    fn kind(&self) -> SampleKind;

    /// Gather one snapshot.
    async fn gather(&self) -> Result<SampleSnapshot, SampleError>;
}
