//! Worker pool, task processor and job scheduler working together.
//!
//! A scheduled job samples a value every half second and fans a scoring task
//! out to the worker pool, which dispatches it through the task processor.
//!
//! Run with: `cargo run --example pipeline`

use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use workset::{
    handler_fn, required_arg, ExecutionOutcome, Handler, HandlerError, JobOutcome, JobScheduler,
    Payload, SchedulerConfig, TaskDescriptor, TaskProcessor, WorkerConfig, WorkerManager,
};

#[tokio::main]
async fn main() -> workset::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,workset=debug")),
        )
        .init();

    let processor = Arc::new(TaskProcessor::new());
    processor.register("score", |payload: Payload| async move {
        let value: i64 = required_arg(&payload, "value")?;
        if value % 7 == 0 {
            return Err(HandlerError::failed(format!("{} is not scoreable", value)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, HandlerError>(json!({ "value": value, "score": (value * 37) % 100 }))
    });

    let pool = Arc::new(WorkerManager::new(
        WorkerConfig::builder().num_workers(2).build(),
        |outcome: ExecutionOutcome<Value>| match outcome.result {
            Ok(value) => println!("[pool] worker {} -> {}", outcome.worker_id, value),
            Err(err) => println!("[pool] worker {} failed: {}", outcome.worker_id, err),
        },
    )?);
    pool.start()?;

    let counter = Arc::new(AtomicI64::new(0));
    let job_pool = pool.clone();
    let job_processor = processor.clone();
    let sampler: Arc<dyn Handler> = Arc::new(handler_fn(move |payload| {
        let step: i64 = required_arg(&payload, "step")?;
        let value = counter.fetch_add(step, Ordering::SeqCst);
        let processor = job_processor.clone();
        job_pool
            .submit(move || async move {
                let task = TaskDescriptor::new("score").arg("value", value);
                Ok::<_, HandlerError>(serde_json::to_value(processor.process(&task).await?)?)
            })
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        Ok(json!(value))
    }));

    let scheduler = JobScheduler::with_sink(
        SchedulerConfig::builder()
            .interval(Duration::from_millis(500))
            .build(),
        |outcome: JobOutcome| {
            if let Err(err) = outcome.result {
                println!("[scheduler] cycle {} job failed: {}", outcome.cycle, err);
            }
        },
    )?;
    let mut payload = Payload::new();
    payload.insert("step".to_string(), json!(3));
    scheduler.add_job(sampler, payload);

    println!("Running for 3 seconds...\n");
    scheduler.start()?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    scheduler.stop();
    scheduler.join().await;
    pool.join().await;
    pool.stop().await;

    println!("\n{} scheduler cycles completed", scheduler.cycles_completed());
    Ok(())
}
