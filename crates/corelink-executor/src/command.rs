//! Command building for the host execution context.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shell::{get_shell_command, resolve_executable_path};

/// Namespaces entered for host execution: mount, UTS, IPC, network, PID.
const NSENTER_NAMESPACE_FLAGS: [&str; 5] = ["-m", "-u", "-i", "-n", "-p"];

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command is empty")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
}

/// Where spawned commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionContext {
    /// Enter the namespaces of `target_pid` (normally the host's init) with
    /// `nsenter`, then run under `bash -c`. Requires a host PID namespace.
    HostNamespaces { target_pid: u32 },
    /// Run under the local shell of this process.
    Local,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::HostNamespaces { target_pid: 1 }
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }

    /// Shell-quoted rendering for logs.
    #[must_use]
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words).unwrap_or_else(|_| format!("{} {:?}", self.program, self.args))
    }
}

/// Builds argv for a command in an execution context.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuilder {
    context: ExecutionContext,
}

impl CommandBuilder {
    /// Create a builder for `context`.
    #[must_use]
    pub const fn new(context: ExecutionContext) -> Self {
        Self { context }
    }

    #[must_use]
    pub const fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Build a shell invocation of `command`.
    ///
    /// # Errors
    /// Returns error if the command is blank.
    pub fn shell(&self, command: &str) -> Result<CommandParts, CommandBuildError> {
        if command.trim().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let (shell, flag) = match self.context {
            ExecutionContext::HostNamespaces { .. } => ("bash".to_string(), "-c"),
            ExecutionContext::Local => get_shell_command(),
        };
        Ok(self.wrap(vec![shell, flag.to_string(), command.to_string()]))
    }

    /// Build a direct invocation of `argv` without a shell.
    ///
    /// # Errors
    /// Returns error if `argv` is empty.
    pub fn direct<I>(&self, argv: I) -> Result<CommandParts, CommandBuildError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        Ok(self.wrap(argv))
    }

    fn wrap(&self, mut argv: Vec<String>) -> CommandParts {
        match self.context {
            ExecutionContext::HostNamespaces { target_pid } => {
                let mut args = vec!["-t".to_string(), target_pid.to_string()];
                args.extend(NSENTER_NAMESPACE_FLAGS.iter().map(ToString::to_string));
                args.push("--".to_string());
                args.extend(argv);
                CommandParts::new("nsenter".to_string(), args)
            }
            ExecutionContext::Local => {
                let program = argv.remove(0);
                CommandParts::new(program, argv)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_shell_wraps_in_nsenter() {
        let parts = CommandBuilder::default().shell("df -h").unwrap();
        assert_eq!(parts.program, "nsenter");
        assert_eq!(
            parts.args,
            ["-t", "1", "-m", "-u", "-i", "-n", "-p", "--", "bash", "-c", "df -h"]
        );
    }

    #[test]
    fn test_local_shell_uses_c_flag() {
        let parts = CommandBuilder::new(ExecutionContext::Local)
            .shell("echo hi")
            .unwrap();
        assert_eq!(parts.args.last().map(String::as_str), Some("echo hi"));
        assert_ne!(parts.program, "nsenter");
    }

    #[test]
    fn test_direct_invocation() {
        let parts = CommandBuilder::new(ExecutionContext::HostNamespaces { target_pid: 7 })
            .direct(["nvidia-smi", "-L"])
            .unwrap();
        assert_eq!(parts.args[..2], ["-t", "7"]);
        assert_eq!(parts.args[parts.args.len() - 2..], ["nvidia-smi", "-L"]);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            CommandBuilder::default().shell("   "),
            Err(CommandBuildError::EmptyCommand)
        ));
        assert!(matches!(
            CommandBuilder::default().direct(Vec::<String>::new()),
            Err(CommandBuildError::EmptyCommand)
        ));
    }

    #[test]
    fn test_display_quotes_arguments() {
        let parts = CommandParts::new("bash".into(), vec!["-c".into(), "echo hi".into()]);
        assert_eq!(parts.display(), "bash -c 'echo hi'");
    }
}
