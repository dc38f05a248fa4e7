//! Background writer for cache objects.
//!
//! Tile requests hand their encoded bytes to a bounded queue and return
//! immediately. A single dispatcher task drains the queue and runs store
//! writes with bounded concurrency.
//!
//! A tile write carries the descriptor timestamp the tile was rendered
//! under. If the descriptor has been rewritten by the time the write runs,
//! the write is skipped; if it is rewritten while the write is in progress,
//! the tile is emptied again so it can never pass as valid.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use super::store::TileStore;
use crate::tasks::PendingWork;

pub const DEFAULT_WRITE_QUEUE: usize = 1024;
pub const DEFAULT_WRITE_CONCURRENCY: usize = 8;

/// The descriptor a tile was rendered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    /// Store key of the descriptor
    pub key: String,
    pub modified: SystemTime,
}

impl Watermark {
    pub fn new(key: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            key: key.into(),
            modified,
        }
    }

    /// Whether the stored descriptor is still the one this names.
    async fn holds(&self, store: &dyn TileStore) -> bool {
        matches!(store.stat(&self.key).await, Ok(Some(meta)) if meta.modified == self.modified)
    }
}

struct WriteJob {
    key: String,
    data: Bytes,
    watermark: Option<Watermark>,
}

#[derive(Debug, Default)]
struct WriterStats {
    failed: AtomicU64,
    dropped: AtomicU64,
    superseded: AtomicU64,
}

/// Handle for submitting cache writes. Cheap to clone.
#[derive(Clone)]
pub struct CacheWriter {
    sender: mpsc::Sender<WriteJob>,
    pending: Arc<PendingWork>,
    stats: Arc<WriterStats>,
}

impl CacheWriter {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn TileStore>, capacity: usize, concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(PendingWork::new());
        let stats = Arc::new(WriterStats::default());

        tokio::spawn(run_writer(
            receiver,
            store,
            Arc::new(Semaphore::new(concurrency.max(1))),
            pending.clone(),
            stats.clone(),
        ));

        Self {
            sender,
            pending,
            stats,
        }
    }

    /// Queue a write without waiting. Returns `false` if it was dropped
    /// because the queue is full.
    ///
    /// With a watermark, the write only lands while that descriptor is
    /// current.
    pub fn submit(&self, key: String, data: Bytes, watermark: Option<Watermark>) -> bool {
        self.pending.start();
        let job = WriteJob {
            key,
            data,
            watermark,
        };
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.pending.finish();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key = %job.key, "Cache write queue full, dropping write");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.pending.finish();
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %job.key, "Cache writer stopped, dropping write");
                false
            }
        }
    }

    /// Queue a write, waiting for queue space. Returns `false` only if the
    /// writer has stopped.
    pub async fn submit_wait(
        &self,
        key: String,
        data: Bytes,
        watermark: Option<Watermark>,
    ) -> bool {
        self.pending.start();
        let job = WriteJob {
            key,
            data,
            watermark,
        };
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job).await {
            self.pending.finish();
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(key = %job.key, "Cache writer stopped, dropping write");
            return false;
        }
        true
    }

    /// Wait until every submitted write has completed or failed.
    pub async fn flush(&self) {
        self.pending.wait_idle().await;
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.pending()
    }

    pub fn failed_writes(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn dropped_writes(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Tile writes discarded because the descriptor changed under them.
    pub fn superseded_writes(&self) -> u64 {
        self.stats.superseded.load(Ordering::Relaxed)
    }
}

async fn run_writer(
    mut receiver: mpsc::Receiver<WriteJob>,
    store: Arc<dyn TileStore>,
    permits: Arc<Semaphore>,
    pending: Arc<PendingWork>,
    stats: Arc<WriterStats>,
) {
    while let Some(job) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            pending.finish();
            break;
        };

        let store = store.clone();
        let pending = pending.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            write_job(&*store, job, &stats).await;
            drop(permit);
            pending.finish();
        });
    }
}

async fn write_job(store: &dyn TileStore, job: WriteJob, stats: &WriterStats) {
    if let Some(watermark) = &job.watermark {
        if !watermark.holds(store).await {
            stats.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(key = %job.key, "Descriptor changed, skipping stale tile write");
            return;
        }
    }

    if let Err(e) = store.put(&job.key, job.data).await {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!(key = %job.key, error = %e, "Cache write failed");
        return;
    }

    // The descriptor may have been rewritten while the put ran; the tile
    // would then look newer than it and pass as valid
    if let Some(watermark) = &job.watermark {
        if !watermark.holds(store).await {
            stats.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(key = %job.key, "Descriptor changed during write, emptying tile");
            if let Err(e) = store.put(&job.key, Bytes::new()).await {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %job.key, error = %e, "Failed to empty superseded tile");
            }
            return;
        }
    }
    debug!(key = %job.key, "Cache write complete");
}
