//! Counting of in-flight background work.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counter of submitted-but-unfinished jobs with a wait-for-zero.
///
/// Shared by the cache writer and the fan-out work queue.
#[derive(Debug, Default)]
pub struct PendingWork {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one submitted job.
    pub fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Record one finished job, waking waiters when none remain.
    pub fn finish(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "finish without start");
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once no job is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
