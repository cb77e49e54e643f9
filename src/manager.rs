//! Worker pool that owns a fixed set of workers and their shared queue.

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;

use crate::config::WorkerConfig;
use crate::error::{HandlerError, Result, WorksetError};
use crate::item::{ExecutionOutcome, WorkItem, WorkItemId};
use crate::processor::{Handler, Payload};
use crate::queue::WorkQueue;
use crate::sink::{ResultSink, SharedSink};
use crate::worker::{Worker, WorkerState};

/// Lifecycle of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Workers built, not yet started. Submitted items wait in the queue.
    Created,
    /// Workers are draining the queue.
    Running,
    /// Workers have been stopped; the pool cannot be restarted.
    Stopped,
}

/// A fixed-size pool of workers sharing one queue and one result sink.
///
/// Dropping a running pool aborts its worker tasks; call [`stop`](Self::stop)
/// to let in-flight items finish.
pub struct WorkerManager<T> {
    config: WorkerConfig,
    queue: Arc<WorkQueue<WorkItem<T>>>,
    workers: Vec<Arc<Worker<T>>>,
    shutdown: Arc<Notify>,
    in_progress: Arc<AtomicUsize>,
    state: Mutex<PoolState>,
    tasks: Mutex<JoinSet<()>>,
    /// Set once every worker task has been joined.
    stopped: watch::Sender<bool>,
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> WorkerManager<T> {
    /// Build a pool with `config.num_workers` workers delivering outcomes to `sink`.
    pub fn new(
        config: WorkerConfig,
        sink: impl ResultSink<ExecutionOutcome<T>> + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new());
        let sink: SharedSink<ExecutionOutcome<T>> = Arc::new(sink);
        let shutdown = Arc::new(Notify::new());
        let in_progress = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.num_workers)
            .map(|worker_id| {
                Arc::new(Worker::new(
                    worker_id,
                    queue.clone(),
                    sink.clone(),
                    config.fetch_timeout,
                    shutdown.clone(),
                    in_progress.clone(),
                ))
            })
            .collect();

        Ok(Self {
            config,
            queue,
            workers,
            shutdown,
            in_progress,
            state: Mutex::new(PoolState::Created),
            tasks: Mutex::new(JoinSet::new()),
            stopped: watch::channel(false).0,
        })
    }

    /// Build a pool of `num_workers` workers with default settings otherwise.
    pub fn with_workers(
        num_workers: usize,
        sink: impl ResultSink<ExecutionOutcome<T>> + 'static,
    ) -> Result<Self> {
        Self::new(
            WorkerConfig::builder().num_workers(num_workers).build(),
            sink,
        )
    }

    /// Spawn every worker on the current tokio runtime.
    ///
    /// Calling `start` on a running pool does nothing.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            PoolState::Running => {
                tracing::debug!("Worker pool already running");
                return Ok(());
            }
            PoolState::Stopped => {
                return Err(WorksetError::WorkerPool(
                    "cannot start a stopped worker pool".to_string(),
                ));
            }
            PoolState::Created => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorksetError::WorkerPool(format!("no tokio runtime available: {}", e)))?;

        let mut tasks = lock(&self.tasks);
        for worker in &self.workers {
            let worker = worker.clone();
            tasks.spawn_on(async move { worker.run().await }, &runtime);
        }
        *state = PoolState::Running;

        tracing::info!(
            workers = self.workers.len(),
            queued = self.queue.len(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Enqueue an async callable. Returns without waiting for it to run.
    pub fn submit<F, Fut>(&self, f: F) -> Result<WorkItemId>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, HandlerError>> + Send + 'static,
    {
        self.enqueue(WorkItem::new(f))
    }

    /// Enqueue a synchronous callable to run on tokio's blocking pool.
    pub fn submit_blocking<F>(&self, f: F) -> Result<WorkItemId>
    where
        F: FnOnce() -> std::result::Result<T, HandlerError> + Send + 'static,
    {
        self.enqueue(WorkItem::blocking(f))
    }

    fn enqueue(&self, item: WorkItem<T>) -> Result<WorkItemId> {
        if *lock(&self.state) == PoolState::Stopped {
            return Err(WorksetError::WorkerPool(
                "cannot submit to a stopped worker pool".to_string(),
            ));
        }

        let id = item.id();
        self.queue.put(item);
        tracing::trace!(item_id = %id, queued = self.queue.len(), "Work item submitted");
        Ok(id)
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// In-flight items run to completion. Items still queued are not
    /// processed. Concurrent and repeated calls all return only after the
    /// workers have exited.
    pub async fn stop(&self) {
        let already_stopping = {
            let mut state = lock(&self.state);
            let previous = *state;
            *state = PoolState::Stopped;
            previous == PoolState::Stopped
        };

        if already_stopping {
            let mut stopped = self.stopped.subscribe();
            let _ = stopped.wait_for(|done| *done).await;
            return;
        }

        tracing::info!(
            in_progress = self.in_progress_count(),
            "Stopping worker pool, waiting for in-flight items"
        );

        for worker in &self.workers {
            tracing::debug!(worker_id = worker.id(), state = ?worker.state(), "Signalling worker");
            worker.stop();
        }
        self.shutdown.notify_waiters();

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        self.stopped.send_replace(true);
        tracing::info!(remaining = self.queue.len(), "Worker pool stopped");
    }

    /// Wait until every submitted item has been executed and reported.
    ///
    /// The workers keep running afterwards. After [`stop`](Self::stop) with
    /// items still queued this never resolves.
    pub async fn join(&self) {
        self.queue.wait_until_empty().await;
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of items waiting to be taken by a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of items currently executing.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    /// State of each worker, indexed by worker id.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state()).collect()
    }
}

impl WorkerManager<Value> {
    /// Enqueue a handler invocation with its named arguments.
    pub fn submit_handler(
        &self,
        handler: Arc<dyn Handler>,
        payload: Payload,
    ) -> Result<WorkItemId> {
        self.submit(move || async move { handler.invoke(payload).await })
    }
}
