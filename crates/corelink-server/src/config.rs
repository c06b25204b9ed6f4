//! Command line and environment configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{ArgAction, Parser, Subcommand, builder::BoolishValueParser};
use corelink_core::line_buffer::DEFAULT_LINE_CAPACITY;
use corelink_executor::{CommandPolicy, ExecutionContext, SessionConfig, policy::DEFAULT_ALLOWED_PREFIXES};
use corelink_session::RegistryConfig;

/// Default server address used by the client subcommands.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8585";

#[derive(Debug, Parser)]
#[command(name = "corelink")]
#[command(author, version, about = "Operator dashboard for GPU host nodes", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the dashboard server (default)
    Serve,
    /// Follow a container's logs through a running server
    Tail {
        container: String,
        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server: String,
        /// Lines kept for replay suppression after a reconnect
        #[arg(long, default_value_t = DEFAULT_LINE_CAPACITY)]
        keep: usize,
    },
    /// Run a command through a running server and print its output
    Exec {
        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

/// Server settings.
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Bind address
    #[arg(long, env = "CORELINK_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Bind port
    #[arg(long, env = "CORELINK_PORT", default_value_t = 8585)]
    pub port: u16,

    /// Docker daemon socket
    #[arg(long, env = "CORELINK_DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    pub docker_socket: String,

    /// Name substring for the filtered container list
    #[arg(long, env = "CORELINK_CONTAINER_PATTERN", default_value = "nosana")]
    pub container_pattern: String,

    /// Enable GPU sampling
    #[arg(long, env = "CORELINK_HAS_GPU", default_value_t = false,
          action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub has_gpu: bool,

    /// Permit commands that match no allowed prefix
    #[arg(long, env = "CORELINK_ALLOW_CUSTOM_COMMANDS", default_value_t = true,
          action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub allow_custom_commands: bool,

    /// Comma separated allowed command prefixes (built-in list when empty)
    #[arg(long, env = "CORELINK_ALLOWED_PREFIXES", value_delimiter = ',')]
    pub allowed_prefixes: Vec<String>,

    /// Command wall-clock timeout in seconds
    #[arg(long, env = "CORELINK_COMMAND_TIMEOUT", default_value_t = 30)]
    pub command_timeout: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[arg(long, env = "CORELINK_KILL_GRACE_MS", default_value_t = 2000)]
    pub kill_grace_ms: u64,

    /// Run commands in the host namespaces through nsenter
    #[arg(long, env = "CORELINK_HOST_NAMESPACE", default_value_t = true,
          action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub host_namespace: bool,

    #[arg(long, env = "CORELINK_GPU_INTERVAL_MS", default_value_t = 2000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub gpu_interval_ms: u64,

    #[arg(long, env = "CORELINK_SYSTEM_INTERVAL_MS", default_value_t = 5000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub system_interval_ms: u64,

    /// Lines of history sent when a log channel attaches
    #[arg(long, env = "CORELINK_LOG_TAIL", default_value_t = 200)]
    pub log_tail: usize,

    /// Bounded outbound frame queue per channel
    #[arg(long, env = "CORELINK_OUTBOUND_CAPACITY", default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Default log directive when RUST_LOG is unset
    #[arg(long, short = 'l', env = "CORELINK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[must_use]
    pub const fn execution_context(&self) -> ExecutionContext {
        if self.host_namespace {
            ExecutionContext::HostNamespaces { target_pid: 1 }
        } else {
            ExecutionContext::Local
        }
    }

    /// Admission policy; an empty prefix list falls back to the built-in one.
    #[must_use]
    pub fn policy(&self) -> CommandPolicy {
        let prefixes: Vec<&str> = self
            .allowed_prefixes
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if prefixes.is_empty() {
            CommandPolicy::new(DEFAULT_ALLOWED_PREFIXES.iter().copied(), self.allow_custom_commands)
        } else {
            CommandPolicy::new(prefixes, self.allow_custom_commands)
        }
    }

    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            session: SessionConfig {
                timeout: Duration::from_secs(self.command_timeout.max(1)),
                kill_grace: Duration::from_millis(self.kill_grace_ms),
            },
            log_tail_lines: self.log_tail,
            outbound_capacity: self.outbound_capacity.max(1),
        }
    }

    #[must_use]
    pub const fn gpu_interval(&self) -> Duration {
        Duration::from_millis(self.gpu_interval_ms)
    }

    #[must_use]
    pub const fn system_interval(&self) -> Duration {
        Duration::from_millis(self.system_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["corelink"]).unwrap();
        let config = cli.config;

        assert_eq!(cli.command, None);
        assert_eq!(config.bind_addr(), "0.0.0.0:8585".parse().unwrap());
        assert_eq!(config.container_pattern, "nosana");
        assert!(!config.has_gpu);
        assert!(config.allow_custom_commands);
        assert_eq!(
            config.execution_context(),
            ExecutionContext::HostNamespaces { target_pid: 1 }
        );

        let registry = config.registry_config();
        assert_eq!(registry.session.timeout, Duration::from_secs(30));
        assert_eq!(registry.session.kill_grace, Duration::from_secs(2));
        assert_eq!(registry.log_tail_lines, 200);
        assert_eq!(registry.outbound_capacity, 256);
        assert_eq!(config.gpu_interval(), Duration::from_secs(2));
        assert_eq!(config.system_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_boolean_switches_take_values() {
        let cli = Cli::try_parse_from([
            "corelink",
            "--has-gpu",
            "true",
            "--allow-custom-commands",
            "false",
            "--host-namespace",
            "no",
        ])
        .unwrap();

        assert!(cli.config.has_gpu);
        assert!(!cli.config.allow_custom_commands);
        assert_eq!(cli.config.execution_context(), ExecutionContext::Local);
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        for flag in ["--gpu-interval-ms", "--system-interval-ms"] {
            let err = Cli::try_parse_from(["corelink", flag, "0"]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{flag}");
        }

        let cli = Cli::try_parse_from(["corelink", "--gpu-interval-ms", "1"]).unwrap();
        assert_eq!(cli.config.gpu_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_allowed_prefixes_restrict_policy() {
        let cli = Cli::try_parse_from([
            "corelink",
            "--allow-custom-commands",
            "false",
            "--allowed-prefixes",
            "uptime, df",
        ])
        .unwrap();
        let policy = cli.config.policy();

        assert!(policy.check("df -h").is_ok());
        assert!(policy.check("uptime").is_ok());
        assert!(policy.check("whoami").is_err());
    }

    #[test]
    fn test_client_subcommands() {
        let cli = Cli::try_parse_from(["corelink", "tail", "nosana-node"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Tail {
                container: "nosana-node".into(),
                server: DEFAULT_SERVER_URL.into(),
                keep: DEFAULT_LINE_CAPACITY,
            })
        );

        let cli = Cli::try_parse_from(["corelink", "exec", "df", "-h"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Exec {
                server: DEFAULT_SERVER_URL.into(),
                command: vec!["df".into(), "-h".into()],
            })
        );
    }
}
