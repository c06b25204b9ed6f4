//! Periodic sample polling and fan-out.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use corelink_core::{SampleKind, SampleSnapshot, traits::SampleSource};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};

/// Per-kind broadcast buffer. Slow subscribers skip ahead.
pub const HUB_CAPACITY: usize = 16;

/// Shortest interval a poller will tick at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fan-out point for samples: one broadcast channel per sample type plus
/// the latest snapshot of each.
#[derive(Debug)]
pub struct SampleHub {
    senders: HashMap<SampleKind, broadcast::Sender<Arc<SampleSnapshot>>>,
    latest: RwLock<HashMap<SampleKind, Arc<SampleSnapshot>>>,
}

impl Default for SampleHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleHub {
    #[must_use]
    pub fn new() -> Self {
        let senders = [SampleKind::Gpu, SampleKind::System]
            .into_iter()
            .map(|kind| (kind, broadcast::channel(HUB_CAPACITY).0))
            .collect();
        Self {
            senders,
            latest: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, kind: SampleKind) -> &broadcast::Sender<Arc<SampleSnapshot>> {
        // Every kind is inserted in `new`.
        &self.senders[&kind]
    }

    /// Subscribe to snapshots of `kind`.
    #[must_use]
    pub fn subscribe(&self, kind: SampleKind) -> broadcast::Receiver<Arc<SampleSnapshot>> {
        self.sender(kind).subscribe()
    }

    /// Publish a snapshot; returns how many subscribers received it.
    pub fn publish(&self, snapshot: SampleSnapshot) -> usize {
        let kind = snapshot.kind();
        let snapshot = Arc::new(snapshot);
        if let Ok(mut latest) = self.latest.write() {
            latest.insert(kind, Arc::clone(&snapshot));
        }
        self.sender(kind).send(snapshot).unwrap_or(0)
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: SampleKind) -> usize {
        self.sender(kind).receiver_count()
    }

    /// Most recent snapshot of `kind`, if any was published.
    #[must_use]
    pub fn latest(&self, kind: SampleKind) -> Option<Arc<SampleSnapshot>> {
        self.latest.read().ok()?.get(&kind).cloned()
    }
}

/// Counters for one poller.
#[derive(Debug, Default)]
pub struct PollerStats {
    published: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl PollerStats {
    /// Ticks whose snapshot was published.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Ticks whose gather failed.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Ticks skipped for lack of subscribers.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Timer task gathering one sample type on a fixed interval.
///
/// A failed tick is logged and skipped; the next tick proceeds normally.
#[derive(Debug)]
pub struct SamplePoller {
    kind: SampleKind,
    stats: Arc<PollerStats>,
    stop_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SamplePoller {
    /// Start polling `source` every `interval`, publishing into `hub`.
    ///
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    #[must_use]
    pub fn start(source: Arc<dyn SampleSource>, hub: Arc<SampleHub>, interval: Duration) -> Self {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let kind = source.kind();
        let stats = Arc::new(PollerStats::default());
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(poll(source, hub, interval, Arc::clone(&stats), stop_rx));
        tracing::info!(sample = %kind, interval = ?interval, "Sample poller started");

        Self {
            kind,
            stats,
            stop_tx: Some(stop_tx),
            join: Some(join),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SampleKind {
        self.kind
    }

    #[must_use]
    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Stop the timer and wait for the task to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
            tracing::info!(sample = %self.kind, "Sample poller stopped");
        }
    }
}

impl Drop for SamplePoller {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

async fn poll(
    source: Arc<dyn SampleSource>,
    hub: Arc<SampleHub>,
    interval: Duration,
    stats: Arc<PollerStats>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let kind = source.kind();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        if hub.subscriber_count(kind) == 0 {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let gathered = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            gathered = source.gather() => gathered,
        };

        match gathered {
            Ok(snapshot) => {
                let delivered = hub.publish(snapshot);
                stats.published.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sample = %kind, delivered, "Published sample");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sample = %kind, "Sample gather failed: {e}");
            }
        }
    }
}
