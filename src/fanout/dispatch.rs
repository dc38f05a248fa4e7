//! Work-unit delivery.
//!
//! Units are fire-and-forget: a parent never waits on the units it
//! dispatches. The local queue is unbounded so a worker dispatching children
//! can never block on a queue that only workers drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::scheduler::PyramidScheduler;
use super::unit::WorkUnit;
use crate::error::DispatchError;
use crate::slide::SlideSource;
use crate::tasks::PendingWork;

/// Asynchronous delivery of work units.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, unit: WorkUnit) -> Result<(), DispatchError>;
}

/// In-process dispatcher backed by an unbounded channel.
#[derive(Clone)]
pub struct LocalDispatcher {
    sender: mpsc::UnboundedSender<WorkUnit>,
    pending: Arc<PendingWork>,
}

/// Consumer half of the local queue, handed to a [`WorkerPool`].
pub struct WorkReceiver {
    receiver: mpsc::UnboundedReceiver<WorkUnit>,
    pending: Arc<PendingWork>,
}

/// Create a local work queue.
pub fn work_queue() -> (LocalDispatcher, WorkReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let pending = Arc::new(PendingWork::new());
    (
        LocalDispatcher {
            sender,
            pending: pending.clone(),
        },
        WorkReceiver { receiver, pending },
    )
}

impl LocalDispatcher {
    /// Units dispatched but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.pending()
    }

    /// Resolve once no unit is queued or running.
    pub async fn wait_idle(&self) {
        self.pending.wait_idle().await;
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, unit: WorkUnit) -> Result<(), DispatchError> {
        self.pending.start();
        if self.sender.send(unit).is_err() {
            self.pending.finish();
            return Err(DispatchError::Closed);
        }
        Ok(())
    }
}

/// Tokio tasks pulling units from a [`WorkReceiver`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,

    /// Units that returned an error or panicked
    failed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn spawn<S>(receiver: WorkReceiver, workers: usize, scheduler: Arc<PyramidScheduler<S>>) -> Self
    where
        S: SlideSource + 'static,
    {
        let WorkReceiver { receiver, pending } = receiver;
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = workers.max(1);
        let failed = Arc::new(AtomicU64::new(0));
        info!(workers, "Starting fan-out workers");

        let handles = (0..workers)
            .map(|worker| {
                let receiver = receiver.clone();
                let pending = pending.clone();
                let scheduler = scheduler.clone();
                let failed = failed.clone();
                tokio::spawn(async move {
                    loop {
                        let unit = { receiver.lock().await.recv().await };
                        let Some(unit) = unit else {
                            break;
                        };
                        if !run_unit(worker, &scheduler, unit).await {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        pending.finish();
                    }
                    debug!(worker, "Fan-out worker stopped");
                })
            })
            .collect();

        Self { handles, failed }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Units that failed or panicked so far.
    pub fn failed_units(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Stop all workers. Queued units are abandoned.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Execute one unit in its own task so a panic cannot take the worker down.
/// Returns whether the unit succeeded.
async fn run_unit<S>(worker: usize, scheduler: &Arc<PyramidScheduler<S>>, unit: WorkUnit) -> bool
where
    S: SlideSource + 'static,
{
    let payload = unit.to_json();
    let scheduler = scheduler.clone();
    match tokio::spawn(async move { scheduler.execute(unit).await }).await {
        Ok(Ok(())) => {
            debug!(worker, unit = %payload, "Work unit finished");
            true
        }
        Ok(Err(e)) => {
            error!(worker, unit = %payload, error = %e, "Work unit failed");
            false
        }
        Err(e) => {
            error!(worker, unit = %payload, error = %e, "Work unit panicked");
            false
        }
    }
}
