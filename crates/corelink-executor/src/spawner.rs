//! Spawner that runs commands in the configured execution context.

use std::process::Stdio;

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use corelink_core::traits::{ExecutorError, SpawnedProcess, Spawner};
use tokio::process::Command;

use crate::command::{CommandBuildError, CommandBuilder, ExecutionContext};

/// Spawns shell commands as their own process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSpawner {
    builder: CommandBuilder,
}

impl HostSpawner {
    /// Spawner for `context`.
    #[must_use]
    pub const fn new(context: ExecutionContext) -> Self {
        Self {
            builder: CommandBuilder::new(context),
        }
    }

    /// Spawner using this process's own shell.
    #[must_use]
    pub const fn local() -> Self {
        Self::new(ExecutionContext::Local)
    }

    #[must_use]
    pub const fn context(&self) -> ExecutionContext {
        self.builder.context()
    }
}

#[async_trait]
impl Spawner for HostSpawner {
    async fn spawn(&self, command: &str) -> Result<SpawnedProcess, ExecutorError> {
        let parts = self
            .builder
            .shell(command)
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;
        let shown = parts.display();

        let (program, args) = parts.into_resolved().await.map_err(|e| match e {
            CommandBuildError::ExecutableNotFound(program) => {
                ExecutorError::ExecutableNotFound(program)
            }
            CommandBuildError::EmptyCommand => ExecutorError::SpawnFailed(e.to_string()),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.group_spawn()?;
        tracing::debug!(command = %shown, pid = ?child.id(), "Spawned command");

        Ok(SpawnedProcess { child })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_spawn_pipes_stdout() {
        use tokio::io::AsyncReadExt;

        let mut process = tokio_test::assert_ok!(HostSpawner::local().spawn("printf abc").await);
        let mut stdout = process.child.inner().stdout.take().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
        assert!(process.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_missing_nsenter_is_reported() {
        // Only meaningful where nsenter is absent from PATH.
        if which::which("nsenter").is_ok() {
            return;
        }
        let err = HostSpawner::default().spawn("true").await.err().unwrap();
        assert!(matches!(err, ExecutorError::ExecutableNotFound(p) if p == "nsenter"));
    }
}
