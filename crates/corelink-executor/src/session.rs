//! Execution session lifecycle: spawn, stream, timeout, terminate.
//!
//! A session moves `idle → running → {completed, timed_out, cancelled,
//! failed}`. Terminal states are absorbing. The session task is the only
//! writer of the session's frames, so exactly one terminal frame is sent and
//! it is always the last one.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use command_group::AsyncGroupChild;
use corelink_core::{
    Frame, SessionId,
    traits::{ExecutorError, Spawner},
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

/// Default wall-clock limit for one command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Exit code reported for a session that hit its deadline (as `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Longest output chunk forwarded without a newline.
const MAX_CHUNK_BYTES: usize = 8 * 1024;

const CHUNK_QUEUE: usize = 64;

/// How long a terminal frame may wait on a full channel before it is dropped.
const TERMINAL_SEND_WAIT: Duration = Duration::from_secs(2);

/// Session timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline armed at spawn time.
    pub timeout: Duration,
    /// Grace between graceful termination and a forced kill.
    pub kill_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepted, not yet spawned.
    Idle,
    /// Process is running.
    Running,
    /// Process exited on its own, whatever its exit code.
    Completed,
    /// Deadline passed; process was terminated.
    TimedOut,
    /// Operator or channel teardown terminated the process.
    Cancelled,
    /// Process could not be spawned or waited on.
    Failed,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }
}

/// Final record of a session, returned once it reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: SessionId,
    pub command: String,
    pub status: SessionStatus,
    /// Process exit code; `128 + signal` when killed by a signal outside
    /// our control, [`TIMEOUT_EXIT_CODE`] on timeout, `None` when cancelled
    /// or never spawned.
    pub exit_code: Option<i32>,
    pub output_bytes: u64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// State of one command invocation.
#[derive(Debug)]
pub struct ExecutionSession {
    id: SessionId,
    command: String,
    started_at: DateTime<Utc>,
    started: Instant,
    output_bytes: u64,
    status: SessionStatus,
}

impl ExecutionSession {
    /// New idle session for `command`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            output_bytes: 0,
            status: SessionStatus::Idle,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub const fn output_bytes(&self) -> u64 {
        self.output_bytes
    }

    /// Apply a transition. Returns `false` and leaves the state untouched
    /// when the transition is not allowed.
    pub fn transition(&mut self, to: SessionStatus) -> bool {
        use SessionStatus::{Cancelled, Failed, Idle, Running};

        let allowed = match (self.status, to) {
            (Idle, Running | Failed | Cancelled) => true,
            (Running, next) => next.is_terminal(),
            _ => false,
        };
        if allowed {
            self.status = to;
        }
        allowed
    }

    fn record_output(&mut self, bytes: usize) {
        self.output_bytes = self.output_bytes.saturating_add(bytes as u64);
    }

    fn report(&self, exit_code: Option<i32>, pid: Option<u32>) -> SessionReport {
        SessionReport {
            id: self.id,
            command: self.command.clone(),
            status: self.status,
            exit_code,
            output_bytes: self.output_bytes,
            pid,
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Owner-side handle to a session task.
///
/// Dropping the handle without waiting cancels the session.
pub struct SessionHandle {
    id: SessionId,
    command: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    status_rx: watch::Receiver<SessionStatus>,
    join: JoinHandle<SessionReport>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &*self.status_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Whether the session has not yet emitted its terminal frame.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.join.is_finished() && !self.status().is_terminal()
    }

    /// Request cancellation. Returns `false` if already requested or the
    /// session has finished.
    pub fn cancel(&mut self) -> bool {
        match self.cancel_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait for the terminal report.
    pub async fn wait(self) -> SessionReport {
        let Self {
            id,
            command,
            cancel_tx,
            join,
            ..
        } = self;
        let report = join.await;
        drop(cancel_tx);
        report.unwrap_or_else(|e| {
            tracing::error!(session_id = %id, "Session task failed: {e}");
            SessionReport {
                id,
                command,
                status: SessionStatus::Failed,
                exit_code: None,
                output_bytes: 0,
                pid: None,
                started_at: Utc::now(),
                elapsed: Duration::ZERO,
            }
        })
    }
}

/// Start a session for `command`, streaming its frames into `sink`.
///
/// Frames: `exec_start`, zero or more `exec_output`, then exactly one of
/// `exec_done` / `exec_error`.
pub fn start(
    spawner: Arc<dyn Spawner>,
    command: impl Into<String>,
    config: SessionConfig,
    sink: mpsc::Sender<Frame>,
) -> SessionHandle {
    let session = ExecutionSession::new(command);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
    let id = session.id();
    let command = session.command().to_string();

    let join = tokio::spawn(run(session, spawner, config, sink, cancel_rx, status_tx));

    SessionHandle {
        id,
        command,
        cancel_tx: Some(cancel_tx),
        status_rx,
        join,
    }
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
    Detached,
}

async fn run(
    mut session: ExecutionSession,
    spawner: Arc<dyn Spawner>,
    config: SessionConfig,
    sink: mpsc::Sender<Frame>,
    mut cancel_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<SessionStatus>,
) -> SessionReport {
    let session_id = session.id();

    let start = Frame::ExecStart {
        command: session.command().to_string(),
    };
    let started = tokio::select! {
        sent = sink.send(start) => sent.is_ok(),
        _ = &mut cancel_rx => false,
    };
    if !started {
        session.transition(SessionStatus::Cancelled);
        status_tx.send_replace(session.status());
        return session.report(None, None);
    }

    let spawned = tokio::select! {
        biased;
        _ = &mut cancel_rx => None,
        result = spawner.spawn(session.command()) => Some(result),
    };

    let mut child = match spawned {
        None => {
            session.transition(SessionStatus::Cancelled);
            send_terminal(&sink, Frame::exec_error("[CANCELLED] Command cancelled"), session_id).await;
            status_tx.send_replace(session.status());
            return session.report(None, None);
        }
        Some(Err(e)) => {
            tracing::warn!(session_id = %session_id, "Failed to spawn command: {e}");
            session.transition(SessionStatus::Failed);
            send_terminal(&sink, Frame::exec_error(spawn_failure_message(&e)), session_id).await;
            status_tx.send_replace(session.status());
            return session.report(None, None);
        }
        Some(Ok(process)) => process.child,
    };

    session.transition(SessionStatus::Running);
    status_tx.send_replace(SessionStatus::Running);
    let pid = child.id();
    tracing::info!(session_id = %session_id, ?pid, command = %session.command(), "Session running");

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_QUEUE);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.inner().stdout.take() {
        readers.push(tokio::spawn(pump(stdout, chunk_tx.clone())));
    }
    if let Some(stderr) = child.inner().stderr.take() {
        readers.push(tokio::spawn(pump(stderr, chunk_tx.clone())));
    }
    drop(chunk_tx);

    let mut streams_open = true;
    let ending = loop {
        tokio::select! {
            chunk = chunk_rx.recv(), if streams_open => match chunk {
                Some(bytes) => {
                    session.record_output(bytes.len());
                    let frame = Frame::ExecOutput { data: String::from_utf8_lossy(&bytes).into_owned() };
                    // A stalled channel must not hold off the deadline or a cancel.
                    tokio::select! {
                        sent = sink.send(frame) => {
                            if sent.is_err() {
                                break Ending::Detached;
                            }
                        }
                        () = &mut deadline => break Ending::TimedOut,
                        _ = &mut cancel_rx => break Ending::Cancelled,
                    }
                }
                None => streams_open = false,
            },
            status = child.wait(), if !streams_open => break Ending::Exited(status),
            () = &mut deadline => break Ending::TimedOut,
            _ = &mut cancel_rx => break Ending::Cancelled,
        }
    };

    let (terminal, exit_code) = match ending {
        Ending::Exited(Ok(status)) => {
            session.transition(SessionStatus::Completed);
            let exit_code = exit_code_of(status);
            let frame = Frame::ExecDone {
                command: session.command().to_string(),
                exit_code,
            };
            (Some(frame), exit_code)
        }
        Ending::Exited(Err(e)) => {
            session.transition(SessionStatus::Failed);
            (Some(Frame::exec_error(format!("[ERROR] Failed to wait for process: {e}"))), None)
        }
        Ending::TimedOut => {
            terminate(&mut child, config.kill_grace).await;
            forward_remaining(&mut session, &mut chunk_rx, &sink);
            session.transition(SessionStatus::TimedOut);
            let frame = Frame::exec_error(format!(
                "[TIMEOUT] Command exceeded time limit of {}s (exit code {TIMEOUT_EXIT_CODE})",
                config.timeout.as_secs_f32()
            ));
            (Some(frame), Some(TIMEOUT_EXIT_CODE))
        }
        Ending::Cancelled => {
            terminate(&mut child, config.kill_grace).await;
            forward_remaining(&mut session, &mut chunk_rx, &sink);
            session.transition(SessionStatus::Cancelled);
            (Some(Frame::exec_error("[CANCELLED] Command cancelled")), None)
        }
        Ending::Detached => {
            terminate(&mut child, config.kill_grace).await;
            session.transition(SessionStatus::Cancelled);
            (None, None)
        }
    };

    for reader in readers {
        reader.abort();
    }

    if let Some(frame) = terminal {
        send_terminal(&sink, frame, session_id).await;
    }
    // Published only once the terminal frame is queued, so a follow-up
    // command on the same channel can never overtake it.
    status_tx.send_replace(session.status());

    tracing::info!(
        session_id = %session_id,
        status = ?session.status(),
        ?exit_code,
        output_bytes = session.output_bytes(),
        "Session finished"
    );
    session.report(exit_code, pid)
}

/// Forward chunks already read before termination, stopping at the first
/// full or closed channel.
fn forward_remaining(
    session: &mut ExecutionSession,
    chunk_rx: &mut mpsc::Receiver<Vec<u8>>,
    sink: &mpsc::Sender<Frame>,
) {
    while let Ok(bytes) = chunk_rx.try_recv() {
        session.record_output(bytes.len());
        let frame = Frame::ExecOutput {
            data: String::from_utf8_lossy(&bytes).into_owned(),
        };
        if sink.try_send(frame).is_err() {
            break;
        }
    }
}

/// Queue the session's terminal frame, waiting at most [`TERMINAL_SEND_WAIT`].
async fn send_terminal(sink: &mpsc::Sender<Frame>, frame: Frame, session_id: SessionId) {
    match tokio::time::timeout(TERMINAL_SEND_WAIT, sink.send(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::debug!(session_id = %session_id, "Channel closed before terminal frame"),
        Err(_) => tracing::warn!(session_id = %session_id, "Channel stalled, terminal frame dropped"),
    }
}

/// Read `reader` into newline-terminated chunks, splitting over-long lines.
async fn pump<R>(reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut chunk = Vec::new();
    loop {
        let available = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(buf) => buf,
            Err(e) => {
                tracing::debug!("Output stream read failed: {e}");
                break;
            }
        };
        let window = &available[..available.len().min(MAX_CHUNK_BYTES - chunk.len())];
        let (take, complete) = match window.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), false),
        };
        chunk.extend_from_slice(&window[..take]);
        reader.consume(take);

        if (complete || chunk.len() >= MAX_CHUNK_BYTES) && tx.send(std::mem::take(&mut chunk)).await.is_err() {
            return;
        }
    }
    if !chunk.is_empty() {
        let _ = tx.send(chunk).await;
    }
}

/// Terminate the process group: SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut AsyncGroupChild, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    if !signal_terminate(child) {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(pid = ?child.id(), "Process ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            tracing::warn!(pid = ?child.id(), "Failed to kill process group: {e}");
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_terminate(child: &AsyncGroupChild) -> bool {
    let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: kill(2) on the process group created by group_spawn.
    unsafe { libc::kill(-pgid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &AsyncGroupChild) -> bool {
    false
}

fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|sig| 128 + sig))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

fn spawn_failure_message(error: &ExecutorError) -> String {
    match error {
        ExecutorError::ExecutableNotFound(program) if program == "nsenter" => {
            "[ERROR] nsenter not found. Is the container running with --pid=host?".to_string()
        }
        other => format!("[ERROR] {other}"),
    }
}
