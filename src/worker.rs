//! Individual worker that drains the shared work queue.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::item::{ExecutionOutcome, WorkItem};
use crate::queue::WorkQueue;
use crate::sink::{deliver_guarded, SharedSink};

/// Lifecycle of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Built but not yet running.
    Created,
    /// Taking and executing items.
    Running,
    /// Stop requested; finishing the current item.
    Stopping,
    /// Run loop has exited.
    Stopped,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// A worker bound to one queue and one result sink.
pub struct Worker<T> {
    id: usize,
    queue: Arc<WorkQueue<WorkItem<T>>>,
    sink: SharedSink<ExecutionOutcome<T>>,
    fetch_timeout: Duration,
    stop_requested: AtomicBool,
    state: AtomicU8,
    shutdown: Arc<Notify>,
    in_progress: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Worker<T> {
    pub(crate) fn new(
        id: usize,
        queue: Arc<WorkQueue<WorkItem<T>>>,
        sink: SharedSink<ExecutionOutcome<T>>,
        fetch_timeout: Duration,
        shutdown: Arc<Notify>,
        in_progress: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            queue,
            sink,
            fetch_timeout,
            stop_requested: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Created.as_u8()),
            shutdown,
            in_progress,
        }
    }

    /// Worker id, unique within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Ask the worker to exit after its current item.
    ///
    /// This does not interrupt an item that is already executing.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if !self.transition(WorkerState::Running, WorkerState::Stopping) {
            self.transition(WorkerState::Created, WorkerState::Stopped);
        }
    }

    /// Check whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Take and execute items until [`stop`](Self::stop) is called.
    ///
    /// Returns immediately if the worker was already run or stopped.
    pub async fn run(&self) {
        if !self.transition(WorkerState::Created, WorkerState::Running) {
            tracing::debug!(worker_id = self.id, state = ?self.state(), "Worker not started");
            return;
        }
        tracing::debug!(worker_id = self.id, "Worker started");

        while !self.is_stop_requested() {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.notified() => None,
                item = self.queue.take(self.fetch_timeout) => item,
            };

            let Some(item) = item else {
                // Timeout or shutdown wake-up, re-check the stop flag
                continue;
            };

            if self.is_stop_requested() {
                tracing::debug!(
                    worker_id = self.id,
                    item_id = %item.id(),
                    "Stop requested, returning item to queue"
                );
                self.queue.requeue_front(item);
                break;
            }

            self.process(item).await;
        }

        self.state.store(WorkerState::Stopped.as_u8(), Ordering::SeqCst);
        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    async fn process(&self, item: WorkItem<T>) {
        let item_id = item.id();
        self.in_progress.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(worker_id = self.id, item_id = %item_id, "Processing work item");

        let started = Instant::now();
        let result = item.execute().await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                tracing::debug!(
                    worker_id = self.id,
                    item_id = %item_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Work item completed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    worker_id = self.id,
                    item_id = %item_id,
                    error = %err,
                    "Work item failed"
                );
            }
        }

        let outcome = ExecutionOutcome {
            id: item_id,
            worker_id: self.id,
            result,
            elapsed,
        };
        deliver_guarded(self.sink.as_ref(), outcome);

        if let Err(e) = self.queue.mark_done() {
            tracing::error!(worker_id = self.id, error = %e, "Failed to acknowledge work item");
        }
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
    }
}
