//! corelink: operator dashboard server for GPU host nodes.
//!
//! Run with: corelink [serve]
//!
//! Then open ws://<host>:8585/api/commands/ws/exec, /api/logs/ws/{id},
//! /api/gpu/ws or /api/system/ws, or use `corelink tail` / `corelink exec`.

mod client;
mod config;
mod lifecycle;
mod routes;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, Command};

fn init_tracing(default_directive: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => lifecycle::run(cli.config).await,
        Command::Tail {
            container,
            server,
            keep,
        } => client::tail(&server, &container, keep).await,
        Command::Exec { server, command } => {
            let code = client::exec(&server, &command.join(" ")).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}
