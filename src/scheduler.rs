//! Periodic job runner.
//!
//! Every cycle runs all registered jobs once, one after another, in the
//! order they were added. The next cycle starts `interval` after the previous
//! one finished, so slow jobs push the schedule back instead of overlapping.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{DuplicateJobPolicy, SchedulerConfig};
use crate::error::{HandlerError, Result, WorksetError};
use crate::processor::{Handler, Payload};
use crate::sink::{deliver_guarded, ResultSink, SharedSink};

/// Identifier of one job entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of running one job in one cycle.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: JobId,
    /// Cycle number, starting at 1.
    pub cycle: u64,
    pub result: std::result::Result<Value, HandlerError>,
    pub elapsed: Duration,
}

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Clone)]
struct JobEntry {
    id: JobId,
    handler: Arc<dyn Handler>,
    payload: Payload,
}

fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    // Compare data pointers only; vtable pointers can differ for the same object.
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SchedulerInner {
    config: SchedulerConfig,
    jobs: Mutex<Vec<JobEntry>>,
    state: Mutex<SchedulerState>,
    wake: Notify,
    cycles: AtomicU64,
    sink: Option<SharedSink<JobOutcome>>,
}

impl SchedulerInner {
    fn is_running(&self) -> bool {
        *lock(&self.state) == SchedulerState::Running
    }

    async fn run(self: Arc<Self>) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Job scheduler started"
        );

        while self.is_running() {
            self.run_cycle().await;

            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if !self.is_running() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = wake => {}
            }
        }

        tracing::info!(
            cycles = self.cycles.load(Ordering::SeqCst),
            "Job scheduler stopped"
        );
    }

    async fn run_cycle(&self) {
        let cycle = self.cycles.load(Ordering::SeqCst) + 1;
        let snapshot: Vec<JobEntry> = lock(&self.jobs).clone();

        tracing::debug!(cycle, jobs = snapshot.len(), "Running scheduler cycle");

        for entry in snapshot {
            let started = Instant::now();
            let handler = entry.handler.clone();
            let payload = entry.payload.clone();
            let result = match AssertUnwindSafe(async move { handler.invoke(payload).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(HandlerError::from_panic(panic)),
            };
            let elapsed = started.elapsed();

            if let Err(e) = &result {
                tracing::warn!(job_id = %entry.id, cycle, error = %e, "Scheduled job failed");
            }

            if let Some(sink) = &self.sink {
                deliver_guarded(
                    sink.as_ref(),
                    JobOutcome {
                        job_id: entry.id,
                        cycle,
                        result,
                        elapsed,
                    },
                );
            }
        }

        self.cycles.store(cycle, Ordering::SeqCst);
    }
}

/// Runs a list of jobs repeatedly with a fixed delay between cycles.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Create an idle scheduler. Job failures are only logged.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create an idle scheduler with the given interval and default settings.
    pub fn with_interval(interval: Duration) -> Result<Self> {
        Self::new(SchedulerConfig::builder().interval(interval).build())
    }

    /// Create an idle scheduler that reports every job outcome to `sink`.
    pub fn with_sink(
        config: SchedulerConfig,
        sink: impl ResultSink<JobOutcome> + 'static,
    ) -> Result<Self> {
        Self::build(config, Some(Arc::new(sink)))
    }

    fn build(config: SchedulerConfig, sink: Option<SharedSink<JobOutcome>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                jobs: Mutex::new(Vec::new()),
                state: Mutex::new(SchedulerState::Idle),
                wake: Notify::new(),
                cycles: AtomicU64::new(0),
                sink,
            }),
            task: Mutex::new(None),
        })
    }

    /// Register a job. Allowed in any state; takes effect from the next cycle.
    ///
    /// Under [`DuplicateJobPolicy::Replace`], adding a handler that is already
    /// registered updates that entry's payload and returns its id.
    pub fn add_job(&self, handler: Arc<dyn Handler>, payload: Payload) -> JobId {
        let mut jobs = lock(&self.inner.jobs);

        if self.inner.config.duplicate_policy == DuplicateJobPolicy::Replace {
            if let Some(entry) = jobs.iter_mut().find(|e| same_handler(&e.handler, &handler)) {
                entry.payload = payload;
                tracing::debug!(job_id = %entry.id, "Replaced payload of scheduled job");
                return entry.id;
            }
        }

        let id = JobId::new();
        jobs.push(JobEntry {
            id,
            handler,
            payload,
        });
        tracing::debug!(job_id = %id, jobs = jobs.len(), "Added scheduled job");
        id
    }

    /// Remove every entry registered with this handler. Returns how many were removed.
    pub fn remove_job(&self, handler: &Arc<dyn Handler>) -> usize {
        let mut jobs = lock(&self.inner.jobs);
        let before = jobs.len();
        jobs.retain(|e| !same_handler(&e.handler, handler));
        let removed = before - jobs.len();
        tracing::debug!(removed, jobs = jobs.len(), "Removed scheduled jobs");
        removed
    }

    /// Remove a single entry by id.
    pub fn remove_job_by_id(&self, id: JobId) -> bool {
        let mut jobs = lock(&self.inner.jobs);
        let before = jobs.len();
        jobs.retain(|e| e.id != id);
        before != jobs.len()
    }

    pub fn job_count(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.inner.state)
    }

    /// Number of cycles that have finished.
    pub fn cycles_completed(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }

    /// Start the scheduling loop; the first cycle runs immediately.
    ///
    /// Starting a running scheduler does nothing. A stopped scheduler cannot
    /// be restarted.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        match *state {
            SchedulerState::Running => return Ok(()),
            SchedulerState::Stopped => {
                return Err(WorksetError::Scheduler(
                    "cannot start a stopped scheduler".to_string(),
                ));
            }
            SchedulerState::Idle => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorksetError::Scheduler(format!("no tokio runtime available: {}", e)))?;

        *state = SchedulerState::Running;
        let inner = self.inner.clone();
        *lock(&self.task) = Some(runtime.spawn(inner.run()));
        Ok(())
    }

    /// Stop scheduling further cycles.
    ///
    /// A cycle already in progress finishes; use [`join`](Self::join) to wait
    /// for it.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == SchedulerState::Stopped {
                return;
            }
            *state = SchedulerState::Stopped;
        }
        self.inner.wake.notify_waiters();
        tracing::debug!("Job scheduler stop requested");
    }

    /// Wait for the scheduling loop to exit after [`stop`](Self::stop).
    pub async fn join(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Scheduler task panicked");
            }
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::handler_fn;
    use serde_json::json;

    fn recording_job(log: Arc<Mutex<Vec<Instant>>>) -> Arc<dyn Handler> {
        Arc::new(handler_fn(move |_| {
            log.lock().unwrap().push(Instant::now());
            Ok(Value::Null)
        }))
    }

    #[tokio::test]
    async fn test_cycle_count_bounded_by_interval() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = JobScheduler::with_interval(Duration::from_millis(100)).unwrap();
        scheduler.add_job(recording_job(log.clone()), Payload::new());

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.stop();
        scheduler.join().await;

        let runs = log.lock().unwrap().len();
        assert!((2..=4).contains(&runs), "unexpected run count {}", runs);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_interval_measured_from_cycle_end() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = log.clone();
        let slow: Arc<dyn Handler> = Arc::new(move |_: Payload| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(Instant::now());
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, HandlerError>(Value::Null)
            }
        });

        let scheduler = JobScheduler::with_interval(Duration::from_millis(100)).unwrap();
        scheduler.add_job(slow, Payload::new());
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        scheduler.stop();
        scheduler.join().await;

        let starts = log.lock().unwrap().clone();
        assert!((2..=3).contains(&starts.len()), "unexpected run count {}", starts.len());
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_removed_job_never_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let job = recording_job(log.clone());
        let scheduler = JobScheduler::with_interval(Duration::from_millis(10)).unwrap();

        scheduler.add_job(job.clone(), Payload::new());
        assert_eq!(scheduler.remove_job(&job), 1);
        assert_eq!(scheduler.job_count(), 0);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        scheduler.join().await;

        assert!(log.lock().unwrap().is_empty());
        assert!(scheduler.cycles_completed() >= 1);
    }

    #[tokio::test]
    async fn test_jobs_run_in_registration_order_and_failures_are_reported() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let sink_outcomes = outcomes.clone();
        let scheduler = JobScheduler::with_sink(
            SchedulerConfig::builder()
                .interval(Duration::from_secs(60))
                .build(),
            move |o: JobOutcome| sink_outcomes.lock().unwrap().push(o),
        )
        .unwrap();

        let first_order = order.clone();
        let first = scheduler.add_job(
            Arc::new(handler_fn(move |_| {
                first_order.lock().unwrap().push("first");
                Err(HandlerError::failed("first job fails"))
            })),
            Payload::new(),
        );
        let second = scheduler.add_job(
            Arc::new(handler_fn(|_| panic!("second job panics"))),
            Payload::new(),
        );
        let third_order = order.clone();
        let third = scheduler.add_job(
            Arc::new(handler_fn(move |payload| {
                third_order.lock().unwrap().push("third");
                Ok(Value::Object(payload))
            })),
            {
                let mut payload = Payload::new();
                payload.insert("n".to_string(), json!(3));
                payload
            },
        );

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();
        scheduler.join().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].job_id, first);
        assert_eq!(
            outcomes[0].result,
            Err(HandlerError::failed("first job fails"))
        );
        assert_eq!(outcomes[1].job_id, second);
        assert!(outcomes[1].result.as_ref().unwrap_err().is_panic());
        assert_eq!(outcomes[2].job_id, third);
        assert_eq!(outcomes[2].result, Ok(json!({"n": 3})));
        assert!(outcomes.iter().all(|o| o.cycle == 1));
    }

    #[tokio::test]
    async fn test_duplicate_policy_allow() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let job = recording_job(log.clone());
        let scheduler = JobScheduler::with_interval(Duration::from_secs(60)).unwrap();

        let a = scheduler.add_job(job.clone(), Payload::new());
        let b = scheduler.add_job(job.clone(), Payload::new());
        assert_ne!(a, b);
        assert_eq!(scheduler.job_count(), 2);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        scheduler.join().await;
        assert_eq!(log.lock().unwrap().len(), 2);

        assert_eq!(scheduler.remove_job(&job), 2);
    }

    #[tokio::test]
    async fn test_duplicate_policy_replace() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let job: Arc<dyn Handler> = Arc::new(handler_fn(move |payload| {
            recorder.lock().unwrap().push(payload.get("v").cloned());
            Ok(Value::Null)
        }));
        let scheduler = JobScheduler::new(
            SchedulerConfig::builder()
                .interval(Duration::from_secs(60))
                .duplicate_policy(DuplicateJobPolicy::Replace)
                .build(),
        )
        .unwrap();

        let mut first = Payload::new();
        first.insert("v".to_string(), json!(1));
        let mut second = Payload::new();
        second.insert("v".to_string(), json!(2));

        let a = scheduler.add_job(job.clone(), first);
        let b = scheduler.add_job(job.clone(), second);
        assert_eq!(a, b);
        assert_eq!(scheduler.job_count(), 1);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        scheduler.join().await;

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(2))]);
    }

    #[tokio::test]
    async fn test_remove_job_by_id_keeps_other_entries() {
        let job = recording_job(Arc::new(Mutex::new(Vec::new())));
        let scheduler = JobScheduler::with_interval(Duration::from_secs(1)).unwrap();
        let a = scheduler.add_job(job.clone(), Payload::new());
        let _b = scheduler.add_job(job.clone(), Payload::new());

        assert!(scheduler.remove_job_by_id(a));
        assert!(!scheduler.remove_job_by_id(a));
        assert_eq!(scheduler.job_count(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let scheduler = JobScheduler::with_interval(Duration::from_millis(20)).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.stop();
        scheduler.join().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(matches!(scheduler.start(), Err(WorksetError::Scheduler(_))));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_wait() {
        let scheduler = JobScheduler::with_interval(Duration::from_secs(3600)).unwrap();
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.cycles_completed(), 1);

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(1), scheduler.join())
            .await
            .expect("stop should wake the scheduler out of its interval wait");
    }

    #[tokio::test]
    async fn test_job_added_while_running_joins_next_cycle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = JobScheduler::with_interval(Duration::from_millis(50)).unwrap();
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.add_job(recording_job(log.clone()), Payload::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();
        scheduler.join().await;

        assert!(!log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_cycle_lets_it_finish() {
        let runs = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicU64::new(0));
        let (runs_in_job, finished_in_job) = (runs.clone(), finished.clone());
        let slow: Arc<dyn Handler> = Arc::new(move |_: Payload| {
            let runs = runs_in_job.clone();
            let finished = finished_in_job.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(Value::Null)
            }
        });

        let scheduler = JobScheduler::with_interval(Duration::from_millis(10)).unwrap();
        scheduler.add_job(slow, Payload::new());
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        scheduler.stop();
        scheduler.join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.cycles_completed(), 1);
    }

    #[tokio::test]
    async fn test_job_edits_job_list_mid_cycle() {
        let scheduler = Arc::new(JobScheduler::with_interval(Duration::from_millis(20)).unwrap());
        let own_id: Arc<Mutex<Option<JobId>>> = Arc::new(Mutex::new(None));
        let self_runs = Arc::new(AtomicU64::new(0));
        let added_log = Arc::new(Mutex::new(Vec::new()));

        let handle = Arc::downgrade(&scheduler);
        let id_cell = own_id.clone();
        let counter = self_runs.clone();
        let log = added_log.clone();
        let once: Arc<dyn Handler> = Arc::new(handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(scheduler) = handle.upgrade() {
                if let Some(id) = *id_cell.lock().unwrap() {
                    assert!(scheduler.remove_job_by_id(id));
                }
                scheduler.add_job(recording_job(log.clone()), Payload::new());
            }
            Ok(Value::Null)
        }));
        *own_id.lock().unwrap() = Some(scheduler.add_job(once, Payload::new()));

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop();
        scheduler.join().await;

        let cycles = scheduler.cycles_completed();
        assert!(cycles >= 2, "expected several cycles, got {}", cycles);
        assert_eq!(self_runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_count(), 1);
        // The job added during cycle 1 joins from cycle 2 onwards.
        assert_eq!(added_log.lock().unwrap().len() as u64, cycles - 1);
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            JobScheduler::with_interval(Duration::ZERO),
            Err(WorksetError::Config(_))
        ));
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let scheduler = JobScheduler::with_interval(Duration::from_millis(10)).unwrap();
        assert!(matches!(scheduler.start(), Err(WorksetError::Scheduler(_))));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
