//! `tail` and `exec` subcommands: channel clients against a running server.

use std::io::Write;

use anyhow::{Context, bail};
use corelink_core::{Frame, LineBuffer};
use corelink_transport::{ChannelClient, ChannelEvent, ClientMessage, ReconnectPolicy};

/// Exit status reported when a command ends without an exit code.
const FAILED_EXIT_CODE: i32 = 1;

fn channel_url(server: &str, path: &str) -> String {
    format!("{}{path}", server.trim_end_matches('/'))
}

/// Lines shown by `tail`.
///
/// A log channel replays recent history every time it attaches, so after a
/// reconnect lines already shown are suppressed until the first new one.
#[derive(Debug)]
struct TailView {
    shown: LineBuffer,
    resyncing: bool,
}

impl TailView {
    fn new(keep: usize) -> Self {
        Self {
            shown: LineBuffer::new(keep),
            resyncing: false,
        }
    }

    fn reopened(&mut self) {
        self.resyncing = !self.shown.is_empty();
    }

    /// Record `line`, returning it if it has not been shown yet.
    fn accept(&mut self, line: String) -> Option<&str> {
        if self.resyncing {
            if self.shown.iter().any(|seen| seen == line) {
                return None;
            }
            self.resyncing = false;
        }
        self.shown.push(line);
        self.shown.last()
    }
}

/// Write one log line, ending it with exactly one newline.
fn write_line(out: &mut impl Write, line: &str) -> std::io::Result<()> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    writeln!(out, "{line}")
}

/// Follow one container's log channel until Ctrl-C or retries run out.
///
/// # Errors
/// Returns error if stdout cannot be written.
pub async fn tail(server: &str, container: &str, keep: usize) -> anyhow::Result<()> {
    let url = channel_url(server, &format!("/api/logs/ws/{container}"));
    let (client, mut events) = ChannelClient::connect(url, ReconnectPolicy::default());
    let mut view = TailView::new(keep);
    let mut opened_once = false;
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                client.close();
                continue;
            }
        };

        match event {
            Some(ChannelEvent::Opened) => {
                if opened_once {
                    view.reopened();
                }
                opened_once = true;
            }
            Some(ChannelEvent::Frame(Frame::LogLine { data, .. })) => {
                if let Some(line) = view.accept(data) {
                    write_line(&mut stdout, line).context("failed to write to stdout")?;
                }
            }
            Some(ChannelEvent::Frame(Frame::Error { data })) => eprintln!("error: {data}"),
            Some(ChannelEvent::Frame(other)) => tracing::debug!(kind = other.kind(), "Ignoring frame"),
            Some(ChannelEvent::Reconnecting { attempt, delay }) => {
                eprintln!("connection lost, retry {attempt} in {delay:?}");
            }
            Some(ChannelEvent::Disconnected) | None => break,
        }
    }

    tracing::debug!(
        retained = view.shown.len(),
        evicted = view.shown.evicted(),
        "Tail finished"
    );
    Ok(())
}

/// Run one command and stream its output. Returns the command's exit code.
///
/// # Errors
/// Returns error if the server cannot be reached, the command is rejected or
/// times out, or the connection drops while it runs.
pub async fn exec(server: &str, command: &str) -> anyhow::Result<i32> {
    let url = channel_url(server, "/api/commands/ws/exec");
    let (client, mut events) = ChannelClient::connect(url, ReconnectPolicy::default());
    let mut submitted = false;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Opened if submitted => {
                bail!("connection lost while the command was running");
            }
            ChannelEvent::Opened => {
                client
                    .send(&ClientMessage::exec(command))
                    .context("failed to submit command")?;
                submitted = true;
            }
            ChannelEvent::Frame(Frame::ExecOutput { data }) => {
                stdout
                    .write_all(data.as_bytes())
                    .and_then(|()| stdout.flush())
                    .context("failed to write to stdout")?;
            }
            ChannelEvent::Frame(Frame::ExecDone { exit_code, .. }) => {
                client.close();
                return Ok(exit_code.unwrap_or(FAILED_EXIT_CODE));
            }
            ChannelEvent::Frame(Frame::ExecError { data } | Frame::Error { data }) => {
                client.close();
                bail!(data);
            }
            ChannelEvent::Frame(_) => {}
            ChannelEvent::Reconnecting { attempt, delay } => {
                tracing::warn!(attempt, ?delay, "Server unreachable, retrying");
            }
            ChannelEvent::Disconnected => break,
        }
    }

    bail!("could not reach {server}")
}
