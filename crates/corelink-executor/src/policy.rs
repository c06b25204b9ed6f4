//! Command admission policy.

use thiserror::Error;

/// Patterns that are always refused, regardless of other settings.
pub const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "mkfs",
    "dd if=",
    "> /dev/",
    "chmod 777 /",
    ":(){ :|:&",
    "shutdown",
    "reboot",
    "poweroff",
    "init 0",
    "init 6",
    "halt",
    "kill -9 1",
    "killall",
    "pkill -9",
    "curl | sh",
    "wget | sh",
    "curl | bash",
    "wget | bash",
];

/// Prefixes accepted even when ad-hoc commands are disabled.
pub const DEFAULT_ALLOWED_PREFIXES: &[&str] = &[
    "npx @nosana/cli",
    "nosana",
    "nvidia-smi",
    "docker ps",
    "docker logs",
    "docker stats",
    "docker inspect",
    "uptime",
    "df -h",
    "free -h",
    "top -bn1",
    "lscpu",
    "lsblk",
    "ip addr",
    "hostname",
    "cat /etc/os-release",
    "uname -a",
];

/// Reason a command was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Empty command")]
    Empty,
    #[error("Command contains blocked pattern: {0}")]
    Blocked(&'static str),
    #[error("Command does not match any allowed prefix")]
    NotAllowed,
}

/// Why a command was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Matched an allowed prefix.
    AllowedPrefix,
    /// Ad-hoc commands are enabled.
    Custom,
}

/// Decides which commands may run.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed_prefixes: Vec<String>,
    allow_custom: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_PREFIXES.iter().copied(), true)
    }
}

impl CommandPolicy {
    /// Create a policy from allowed prefixes and the ad-hoc switch.
    #[must_use]
    pub fn new<I>(allowed_prefixes: I, allow_custom: bool) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            allowed_prefixes: allowed_prefixes.into_iter().map(Into::into).collect(),
            allow_custom,
        }
    }

    #[must_use]
    pub const fn allows_custom(&self) -> bool {
        self.allow_custom
    }

    /// Check a command, returning the trimmed command on success.
    ///
    /// # Errors
    /// Returns the refusal reason.
    pub fn check<'a>(&self, command: &'a str) -> Result<(&'a str, Admission), PolicyError> {
        let cmd = command.trim();
        if cmd.is_empty() {
            return Err(PolicyError::Empty);
        }

        if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| cmd.contains(*p)) {
            return Err(PolicyError::Blocked(pattern));
        }

        if self.allowed_prefixes.iter().any(|p| cmd.starts_with(p.as_str())) {
            return Ok((cmd, Admission::AllowedPrefix));
        }

        if self.allow_custom {
            Ok((cmd, Admission::Custom))
        } else {
            Err(PolicyError::NotAllowed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rejected() {
        assert_eq!(CommandPolicy::default().check("  \n"), Err(PolicyError::Empty));
    }

    #[test]
    fn test_blocked_pattern_wins_over_prefix() {
        let policy = CommandPolicy::new(["docker ps"], true);
        assert_eq!(
            policy.check("docker ps; reboot"),
            Err(PolicyError::Blocked("reboot"))
        );
    }

    #[test]
    fn test_allowed_prefix_without_custom() {
        let policy = CommandPolicy::new(DEFAULT_ALLOWED_PREFIXES.iter().copied(), false);
        assert_eq!(
            policy.check("  df -h /  "),
            Ok(("df -h /", Admission::AllowedPrefix))
        );
        assert_eq!(policy.check("ls /tmp"), Err(PolicyError::NotAllowed));
    }

    #[test]
    fn test_custom_commands() {
        let policy = CommandPolicy::default();
        assert_eq!(policy.check("echo hello"), Ok(("echo hello", Admission::Custom)));
    }
}
