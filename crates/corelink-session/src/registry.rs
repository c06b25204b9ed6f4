//! Channel registry: the process-wide table of open channels.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use corelink_core::{
    ChannelId, Frame, SampleKind, SampleSnapshot,
    traits::{LogSource, LogSourceError, Spawner},
};
use corelink_executor::{
    CommandPolicy, PolicyError, PresetCatalog, SessionConfig, SessionHandle, session,
};
use futures::{StreamExt, future::join_all};
use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{log_tail::LogTailCursor, poller::SampleHub};

/// Default lines of history requested when a log tail attaches.
pub const DEFAULT_LOG_TAIL_LINES: usize = 200;

/// Default bound of a channel's outbound frame queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Category of data a channel carries, fixed at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "sample", rename_all = "snake_case")]
pub enum LogicalStream {
    LogTail,
    Exec,
    Poll(SampleKind),
}

impl fmt::Display for LogicalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogTail => f.write_str("log"),
            Self::Exec => f.write_str("exec"),
            Self::Poll(kind) => write!(f, "{kind} poll"),
        }
    }
}

/// Inbound request routed to a channel's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Exec { command: String },
    Preset { name: String },
    Cancel,
    Select { container: String },
    Subscribe(SampleKind),
    Unsubscribe(SampleKind),
    Ping,
}

impl Request {
    /// Short name used in logs and error frames.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Preset { .. } => "preset",
            Self::Cancel => "cancel",
            Self::Select { .. } => "select",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Ping => "ping",
        }
    }
}

/// Routing error.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Channel not found: {0}")]
    UnknownChannel(ChannelId),
    #[error("Registry is shut down")]
    ShutDown,
    #[error("'{request}' is not supported on a {stream} channel")]
    WrongStream {
        request: &'static str,
        stream: LogicalStream,
    },
    #[error("A command is already running")]
    Busy,
    #[error("No command is running")]
    NotRunning,
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    LogSource(#[from] LogSourceError),
}

impl RouteError {
    /// Frame reporting this error to the channel, if it has one.
    #[must_use]
    pub fn to_frame(&self) -> Option<Frame> {
        match self {
            Self::UnknownChannel(_) | Self::ShutDown => None,
            Self::Busy | Self::UnknownPreset(_) => Some(Frame::exec_error(self.to_string())),
            Self::Policy(e) => Some(Frame::exec_error(format!("[BLOCKED] {e}"))),
            Self::WrongStream { .. } | Self::NotRunning | Self::LogSource(_) => {
                Some(Frame::error(self.to_string()))
            }
        }
    }
}

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub session: SessionConfig,
    pub log_tail_lines: usize,
    pub outbound_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// External collaborators the registry routes work to.
pub struct Collaborators {
    pub spawner: Arc<dyn Spawner>,
    pub log_source: Arc<dyn LogSource>,
    pub hub: Arc<SampleHub>,
    pub policy: CommandPolicy,
    pub presets: PresetCatalog,
}

/// What a deregistration released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub channel_id: ChannelId,
    pub session_cancelled: bool,
    pub cursor_detached: bool,
    pub subscriptions: usize,
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub stream: LogicalStream,
    pub selector: Option<String>,
    pub age: Duration,
    pub idle: Duration,
    pub running_command: Option<String>,
    pub container: Option<String>,
    pub subscriptions: Vec<SampleKind>,
}

/// One open channel and the resource slots it owns.
struct ChannelEntry {
    stream: LogicalStream,
    selector: Option<String>,
    outbound: mpsc::Sender<Frame>,
    opened_at: Instant,
    last_activity: Instant,
    session: Option<SessionHandle>,
    cursor: Option<LogTailCursor>,
    subscriptions: HashMap<SampleKind, JoinHandle<()>>,
}

impl ChannelEntry {
    fn running_session(&mut self) -> Option<&mut SessionHandle> {
        self.session.as_mut().filter(|s| s.is_running())
    }

    fn info(&self, id: ChannelId) -> ChannelInfo {
        ChannelInfo {
            id,
            stream: self.stream,
            selector: self.selector.clone(),
            age: self.opened_at.elapsed(),
            idle: self.last_activity.elapsed(),
            running_command: self
                .session
                .as_ref()
                .filter(|s| s.is_running())
                .map(|s| s.command().to_string()),
            container: self
                .cursor
                .as_ref()
                .filter(|c| c.is_attached())
                .map(|c| c.container().to_string()),
            subscriptions: self.subscriptions.keys().copied().collect(),
        }
    }
}

/// Process-wide table of open channels.
///
/// Every mutation goes through one lock, so two close events for the same
/// channel can never release its resources twice. Frames are sent outside
/// the lock.
pub struct ChannelRegistry {
    spawner: Arc<dyn Spawner>,
    log_source: Arc<dyn LogSource>,
    hub: Arc<SampleHub>,
    policy: CommandPolicy,
    presets: PresetCatalog,
    config: RegistryConfig,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    closed: AtomicBool,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: RegistryConfig) -> Self {
        let Collaborators {
            spawner,
            log_source,
            hub,
            policy,
            presets,
        } = collaborators;
        Self {
            spawner,
            log_source,
            hub,
            policy,
            presets,
            config,
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<SampleHub> {
        &self.hub
    }

    #[must_use]
    pub const fn presets(&self) -> &PresetCatalog {
        &self.presets
    }

    #[must_use]
    pub const fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Register a new channel bound to `stream`.
    ///
    /// Returns the channel id and the receiving end of its bounded outbound
    /// queue. A log channel with a selector starts tailing immediately; a
    /// poll channel starts subscribed to its sample type. If the log source
    /// cannot follow the selector, the channel still opens and receives an
    /// `error` frame.
    ///
    /// # Errors
    /// Returns error if the registry has been shut down.
    pub async fn open(
        &self,
        stream: LogicalStream,
        selector: Option<String>,
    ) -> Result<(ChannelId, mpsc::Receiver<Frame>), RouteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouteError::ShutDown);
        }

        let id = ChannelId::new_v4();
        let (outbound, rx) = mpsc::channel(self.config.outbound_capacity.max(1));

        let mut attach_error = None;
        let cursor = match (stream, selector.as_deref()) {
            (LogicalStream::LogTail, Some(container)) => {
                match self.attach_cursor(id, container, &outbound).await {
                    Ok(cursor) => Some(cursor),
                    Err(e) => {
                        attach_error = Some(RouteError::from(e));
                        None
                    }
                }
            }
            _ => None,
        };

        let now = Instant::now();
        let mut entry = ChannelEntry {
            stream,
            selector,
            outbound: outbound.clone(),
            opened_at: now,
            last_activity: now,
            session: None,
            cursor,
            subscriptions: HashMap::new(),
        };
        if let LogicalStream::Poll(kind) = stream {
            self.subscribe_entry(&mut entry, kind);
        }

        {
            let mut channels = self.channels.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(RouteError::ShutDown);
            }
            channels.insert(id, entry);
        }
        tracing::info!(channel_id = %id, stream = %stream, "Channel opened");

        if let Some(e) = attach_error {
            tracing::warn!(channel_id = %id, "Log tail did not start: {e}");
            if let Some(frame) = e.to_frame() {
                let _ = outbound.send(frame).await;
            }
        }

        Ok((id, rx))
    }

    /// Route one inbound request.
    ///
    /// Rejections are reported to the channel as a frame before the error
    /// is returned to the caller.
    ///
    /// # Errors
    /// Returns the rejection reason.
    pub async fn route(&self, id: ChannelId, request: Request) -> Result<(), RouteError> {
        let outbound = {
            let mut channels = self.channels.lock().await;
            let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
            entry.last_activity = Instant::now();
            entry.outbound.clone()
        };
        tracing::debug!(channel_id = %id, request = request.name(), "Routing request");

        let result = match request {
            Request::Exec { command } => self.submit(id, &command).await,
            Request::Preset { name } => self.run_preset(id, &name).await,
            Request::Cancel => self.cancel(id).await.map(|_| ()),
            Request::Select { container } => self.attach_log(id, &container).await,
            Request::Subscribe(kind) => self.subscribe(id, kind).await,
            Request::Unsubscribe(kind) => self.unsubscribe(id, kind).await.map(|_| ()),
            Request::Ping => {
                let _ = outbound.send(Frame::Pong).await;
                Ok(())
            }
        };

        if let Err(e) = &result {
            tracing::warn!(channel_id = %id, "Request rejected: {e}");
            if let Some(frame) = e.to_frame() {
                let _ = outbound.send(frame).await;
            }
        }
        result
    }

    /// Queue a frame on a channel's outbound queue.
    ///
    /// # Errors
    /// Returns error if the channel is not registered.
    pub async fn notify(&self, id: ChannelId, frame: Frame) -> Result<(), RouteError> {
        let outbound = self
            .channels
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.outbound.clone())
            .ok_or(RouteError::UnknownChannel(id))?;
        // A closed queue means the transport is already tearing down.
        let _ = outbound.send(frame).await;
        Ok(())
    }

    /// Start an execution session for `command` on an exec channel.
    ///
    /// # Errors
    /// Returns error if the command is refused by policy, a session is
    /// already running on the channel, or the channel is not an exec channel.
    pub async fn submit(&self, id: ChannelId, command: &str) -> Result<(), RouteError> {
        let (command, admission) = self.policy.check(command)?;

        let mut channels = self.channels.lock().await;
        let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
        require_stream(entry, "exec", |s| s == LogicalStream::Exec)?;
        if entry.running_session().is_some() {
            return Err(RouteError::Busy);
        }

        let handle = session::start(
            Arc::clone(&self.spawner),
            command,
            self.config.session,
            entry.outbound.clone(),
        );
        tracing::info!(
            channel_id = %id,
            session_id = %handle.id(),
            command,
            admission = ?admission,
            "Command accepted"
        );
        entry.session = Some(handle);
        Ok(())
    }

    /// Run a preset by name.
    ///
    /// # Errors
    /// Returns error if the preset is unknown or the submit is rejected.
    pub async fn run_preset(&self, id: ChannelId, name: &str) -> Result<(), RouteError> {
        let command = self
            .presets
            .get(name)
            .map(|p| p.command.clone())
            .ok_or_else(|| RouteError::UnknownPreset(name.to_string()))?;
        self.submit(id, &command).await
    }

    /// Request cancellation of the channel's running session.
    ///
    /// # Errors
    /// Returns error if no session is running.
    pub async fn cancel(&self, id: ChannelId) -> Result<bool, RouteError> {
        let mut channels = self.channels.lock().await;
        let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
        let session = entry.running_session().ok_or(RouteError::NotRunning)?;
        tracing::info!(channel_id = %id, session_id = %session.id(), "Cancel requested");
        Ok(session.cancel())
    }

    /// Switch a log channel to `container`.
    ///
    /// The previous cursor is detached before the new one attaches. If the
    /// new container cannot be followed the channel is left with no cursor.
    ///
    /// # Errors
    /// Returns error if the channel is not a log channel or the container
    /// cannot be followed.
    pub async fn attach_log(&self, id: ChannelId, container: &str) -> Result<(), RouteError> {
        let outbound = {
            let mut channels = self.channels.lock().await;
            let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
            require_stream(entry, "select", |s| s == LogicalStream::LogTail)?;
            if let Some(mut old) = entry.cursor.take() {
                old.detach();
            }
            entry.selector = Some(container.to_string());
            entry.outbound.clone()
        };

        let cursor = self.attach_cursor(id, container, &outbound).await?;

        let mut channels = self.channels.lock().await;
        // A close that raced the attach drops the cursor here, detaching it.
        let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
        if let Some(mut stale) = entry.cursor.replace(cursor) {
            stale.detach();
        }
        Ok(())
    }

    async fn attach_cursor(
        &self,
        id: ChannelId,
        container: &str,
        outbound: &mpsc::Sender<Frame>,
    ) -> Result<LogTailCursor, LogSourceError> {
        LogTailCursor::attach(
            self.log_source.as_ref(),
            container,
            id,
            self.config.log_tail_lines,
            outbound.clone(),
        )
        .await
    }

    /// Subscribe a poll channel to `kind`. Subscribing twice is a no-op.
    ///
    /// # Errors
    /// Returns error if the channel is not a poll channel.
    pub async fn subscribe(&self, id: ChannelId, kind: SampleKind) -> Result<(), RouteError> {
        let mut channels = self.channels.lock().await;
        let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
        require_stream(entry, "subscribe", |s| matches!(s, LogicalStream::Poll(_)))?;
        self.subscribe_entry(entry, kind);
        Ok(())
    }

    /// Drop a poll channel's subscription to `kind`. Returns whether one
    /// existed.
    ///
    /// # Errors
    /// Returns error if the channel is not a poll channel.
    pub async fn unsubscribe(&self, id: ChannelId, kind: SampleKind) -> Result<bool, RouteError> {
        let task = {
            let mut channels = self.channels.lock().await;
            let entry = channels.get_mut(&id).ok_or(RouteError::UnknownChannel(id))?;
            require_stream(entry, "unsubscribe", |s| matches!(s, LogicalStream::Poll(_)))?;
            entry.subscriptions.remove(&kind)
        };
        let Some(task) = task else {
            return Ok(false);
        };
        task.abort();
        let _ = task.await;
        tracing::debug!(channel_id = %id, sample = %kind, "Unsubscribed");
        Ok(true)
    }

    fn subscribe_entry(&self, entry: &mut ChannelEntry, kind: SampleKind) {
        if entry.subscriptions.contains_key(&kind) {
            return;
        }
        let latest = self.hub.latest(kind);
        let updates = BroadcastStream::new(self.hub.subscribe(kind));
        let outbound = entry.outbound.clone();
        let task = tokio::spawn(forward_samples(kind, latest, updates, outbound));
        entry.subscriptions.insert(kind, task);
    }

    /// Remove a channel and release everything it owns.
    ///
    /// A running session is cancelled and awaited, the log cursor detached,
    /// and subscriptions removed. Returns `None` if the channel was already
    /// gone, so repeated close events release nothing twice.
    pub async fn deregister(&self, id: ChannelId) -> Option<Released> {
        let entry = self.channels.lock().await.remove(&id)?;
        let released = release(id, entry).await;
        tracing::info!(
            channel_id = %id,
            session_cancelled = released.session_cancelled,
            cursor_detached = released.cursor_detached,
            subscriptions = released.subscriptions,
            "Channel closed"
        );
        Some(released)
    }

    /// Refuse new channels and release every open one.
    pub async fn shutdown(&self) -> Vec<Released> {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.channels.lock().await.drain().collect();
        let count = drained.len();
        let released = join_all(drained.into_iter().map(|(id, entry)| release(id, entry))).await;
        tracing::info!(channels = count, "Channel registry drained");
        released
    }

    /// Number of open channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Snapshot of every open channel.
    pub async fn channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .lock()
            .await
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect()
    }
}

fn require_stream(
    entry: &ChannelEntry,
    request: &'static str,
    allowed: impl Fn(LogicalStream) -> bool,
) -> Result<(), RouteError> {
    if allowed(entry.stream) {
        Ok(())
    } else {
        Err(RouteError::WrongStream {
            request,
            stream: entry.stream,
        })
    }
}

async fn release(id: ChannelId, mut entry: ChannelEntry) -> Released {
    let cursor_detached = entry.cursor.take().is_some_and(|mut c| c.detach());

    let subscriptions = entry.subscriptions.len();
    for (_, task) in entry.subscriptions.drain() {
        task.abort();
        let _ = task.await;
    }

    let mut session_cancelled = false;
    if let Some(mut handle) = entry.session.take() {
        if handle.is_running() {
            session_cancelled = handle.cancel();
            let report = handle.wait().await;
            tracing::debug!(
                channel_id = %id,
                session_id = %report.id,
                status = ?report.status,
                "Session released"
            );
        }
    }

    Released {
        channel_id: id,
        session_cancelled,
        cursor_detached,
        subscriptions,
    }
}

async fn forward_samples(
    kind: SampleKind,
    latest: Option<Arc<SampleSnapshot>>,
    mut updates: BroadcastStream<Arc<SampleSnapshot>>,
    outbound: mpsc::Sender<Frame>,
) {
    if let Some(snapshot) = latest {
        if outbound.send(snapshot.to_frame()).await.is_err() {
            return;
        }
    }
    while let Some(item) = updates.next().await {
        match item {
            Ok(snapshot) => {
                if outbound.send(snapshot.to_frame()).await.is_err() {
                    return;
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!(sample = %kind, skipped, "Slow subscriber skipped samples");
            }
        }
    }
}
