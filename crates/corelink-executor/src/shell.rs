//! Shell detection and executable lookup.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Returns the shell program and its command flag for local execution.
///
/// Returns `(shell_program, shell_arg)` where:
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the `$SHELL` program with `-c`, falling back to `/bin/sh`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        UnixShell::current_shell().get_shell_command()
    }
}

/// Resolve an executable by name.
///
/// Absolute paths are accepted as-is when they point at a file; anything
/// else is looked up on the current `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from("/bin/sh"))
    }

    /// Create from a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        let shell = match path.file_name() {
            Some(name) if name == OsStr::new("zsh") => Self::Zsh(path_buf),
            Some(name) if name == OsStr::new("bash") => Self::Bash(path_buf),
            Some(name) if name == OsStr::new("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        };
        Some(shell)
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (String, &'static str) {
        (self.path().to_string_lossy().into_owned(), "-c")
    }
}
