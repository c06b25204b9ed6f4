//! Container log tailing.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use corelink_core::{
    ChannelId, Frame,
    traits::{LogChunkStream, LogSource, LogSourceError},
};
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};

/// Longest line forwarded before it is split.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles newline-terminated lines from arbitrary chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes (newline kept).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(i) = rest.iter().position(|b| *b == b'\n') {
            self.pending.extend_from_slice(&rest[..=i]);
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
            rest = &rest[i + 1..];
        }
        self.pending.extend_from_slice(rest);
        if self.pending.len() >= MAX_LINE_BYTES {
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
        lines
    }

    /// Flush a trailing partial line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}

/// Follow handle for one container on one channel.
///
/// Detaching aborts the forwarding task, which drops the source stream and
/// with it the underlying follow handle. Dropping the cursor detaches it.
#[derive(Debug)]
pub struct LogTailCursor {
    container: String,
    channel_id: ChannelId,
    position: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl LogTailCursor {
    /// Attach to `container`, forwarding `log_line` frames into `sink`.
    ///
    /// # Errors
    /// Returns error if the source cannot start following the container;
    /// no task is started in that case.
    pub async fn attach(
        source: &dyn LogSource,
        container: &str,
        channel_id: ChannelId,
        tail: usize,
        sink: mpsc::Sender<Frame>,
    ) -> Result<Self, LogSourceError> {
        let stream = source.follow(container, tail).await?;
        let position = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(forward(
            stream,
            container.to_string(),
            channel_id,
            Arc::clone(&position),
            sink,
        ));
        tracing::info!(channel_id = %channel_id, container, "Log tail attached");

        Ok(Self {
            container: container.to_string(),
            channel_id,
            position,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Lines forwarded so far. Monotonic.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    /// Whether the forwarding task is still live.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop following. Idempotent; returns whether this call detached.
    pub fn detach(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        tracing::info!(
            channel_id = %self.channel_id,
            container = %self.container,
            position = self.position(),
            "Log tail detached"
        );
        true
    }
}

impl Drop for LogTailCursor {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn forward(
    mut stream: LogChunkStream,
    container: String,
    channel_id: ChannelId,
    position: Arc<AtomicU64>,
    sink: mpsc::Sender<Frame>,
) {
    let mut splitter = LineSplitter::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                for line in splitter.push(&chunk) {
                    position.fetch_add(1, Ordering::Relaxed);
                    let frame = Frame::LogLine {
                        container: container.clone(),
                        data: line,
                    };
                    if sink.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(channel_id = %channel_id, container = %container, "Log stream failed: {e}");
                let _ = sink.send(Frame::error(e.to_string())).await;
                return;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        position.fetch_add(1, Ordering::Relaxed);
        let _ = sink
            .send(Frame::LogLine {
                container: container.clone(),
                data: line,
            })
            .await;
    }
    tracing::debug!(channel_id = %channel_id, container = %container, "Log stream ended");
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    use super::*;

    /// Log source backed by per-container channels. Each followed stream
    /// carries a guard whose drop signals that the follow handle was released.
    #[derive(Default)]
    pub(crate) struct MockLogSource {
        feeds: std::sync::Mutex<HashMap<String, mpsc::Receiver<Result<Bytes, LogSourceError>>>>,
        released: std::sync::Mutex<Vec<oneshot::Receiver<()>>>,
    }

    impl MockLogSource {
        pub(crate) fn feed(&self, container: &str) -> mpsc::Sender<Result<Bytes, LogSourceError>> {
            let (tx, rx) = mpsc::channel(16);
            self.feeds.lock().unwrap().insert(container.to_string(), rx);
            tx
        }

        /// Receivers resolving once each followed stream is dropped.
        pub(crate) fn take_release_signals(&self) -> Vec<oneshot::Receiver<()>> {
            std::mem::take(&mut *self.released.lock().unwrap())
        }
    }

    #[async_trait]
    impl LogSource for MockLogSource {
        async fn follow(&self, container: &str, _tail: usize) -> Result<LogChunkStream, LogSourceError> {
            let rx = self
                .feeds
                .lock()
                .unwrap()
                .remove(container)
                .ok_or_else(|| LogSourceError::NotFound(container.to_string()))?;
            let (guard, released) = oneshot::channel::<()>();
            self.released.lock().unwrap().push(released);
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(move |item| {
                let _ = guard.is_closed();
                item
            });
            Ok(stream.boxed())
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("sink closed")
    }

    #[test]
    fn test_splitter_reassembles_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"par").is_empty());
        assert_eq!(splitter.push(b"tial\nnext\nta"), ["partial\n", "next\n"]);
        assert_eq!(splitter.finish().as_deref(), Some("ta"));
        assert_eq!(splitter.finish(), None);
    }

    #[tokio::test]
    async fn test_forwards_lines_in_order() {
        let source = MockLogSource::default();
        let feed = source.feed("web");
        let (tx, mut rx) = mpsc::channel(16);
        let cursor = LogTailCursor::attach(&source, "web", ChannelId::new_v4(), 200, tx)
            .await
            .unwrap();

        feed.send(Ok(Bytes::from_static(b"one\ntw"))).await.unwrap();
        feed.send(Ok(Bytes::from_static(b"o\nthree\n"))).await.unwrap();

        for expected in ["one\n", "two\n", "three\n"] {
            assert_eq!(
                next_frame(&mut rx).await,
                Frame::LogLine {
                    container: "web".into(),
                    data: expected.into()
                }
            );
        }
        assert_eq!(cursor.position(), 3);
        assert!(cursor.is_attached());
    }

    #[tokio::test]
    async fn test_missing_container_starts_nothing() {
        let source = MockLogSource::default();
        let (tx, _rx) = mpsc::channel(16);
        let err = LogTailCursor::attach(&source, "ghost", ChannelId::new_v4(), 200, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, LogSourceError::NotFound(c) if c == "ghost"));
        assert!(source.take_release_signals().is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_becomes_error_frame() {
        let source = MockLogSource::default();
        let feed = source.feed("db");
        let (tx, mut rx) = mpsc::channel(16);
        let _cursor = LogTailCursor::attach(&source, "db", ChannelId::new_v4(), 200, tx)
            .await
            .unwrap();

        feed.send(Err(LogSourceError::Stream("socket reset".into())))
            .await
            .unwrap();
        let Frame::Error { data } = next_frame(&mut rx).await else {
            panic!("expected error frame");
        };
        assert!(data.contains("socket reset"));
    }

    #[tokio::test]
    async fn test_detach_is_idempotent_and_releases_stream() {
        let source = MockLogSource::default();
        let _feed = source.feed("web");
        let (tx, _rx) = mpsc::channel(16);
        let mut cursor = LogTailCursor::attach(&source, "web", ChannelId::new_v4(), 200, tx)
            .await
            .unwrap();
        let mut released = source.take_release_signals();

        assert!(cursor.detach());
        assert!(!cursor.detach());
        assert!(!cursor.is_attached());

        let signal = released.pop().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(2), signal).await.is_ok(),
            "follow handle was not released"
        );
    }

    #[tokio::test]
    async fn test_drop_releases_stream() {
        let source = MockLogSource::default();
        let _feed = source.feed("web");
        let (tx, _rx) = mpsc::channel(16);
        let cursor = LogTailCursor::attach(&source, "web", ChannelId::new_v4(), 200, tx)
            .await
            .unwrap();
        let signal = source.take_release_signals().pop().unwrap();

        drop(cursor);
        assert!(tokio::time::timeout(Duration::from_secs(2), signal).await.is_ok());
    }
}
