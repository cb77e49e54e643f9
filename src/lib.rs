//! # workset - in-process task dispatch
//!
//! A small concurrency core for running opaque units of work on tokio:
//!
//! - **Worker pool**: a fixed number of workers drain a shared FIFO queue and
//!   report every outcome, success or failure, to a result sink
//! - **Task processor**: a registry of named handlers with timed invocation
//! - **Job scheduler**: re-runs registered jobs with a fixed delay between
//!   cycles
//!
//! The three components are independent. Compose them by holding all three;
//! a scheduled job can submit work to the pool or dispatch through the
//! processor.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use workset::{
//!     required_arg, ExecutionOutcome, HandlerError, Payload, TaskDescriptor, TaskProcessor,
//!     WorkerManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> workset::Result<()> {
//!     let processor = TaskProcessor::new();
//!     processor.register("double", |payload: Payload| async move {
//!         let x: i64 = required_arg(&payload, "x")?;
//!         Ok::<_, HandlerError>(json!(x * 2))
//!     });
//!
//!     let report = processor
//!         .process(&TaskDescriptor::new("double").arg("x", 21))
//!         .await?;
//!     println!("{} -> {}", report.task, report.result);
//!
//!     let pool = WorkerManager::with_workers(4, |outcome: ExecutionOutcome<u64>| {
//!         println!("item {} -> {:?}", outcome.id, outcome.result);
//!     })?;
//!     pool.start()?;
//!     pool.submit(|| async { Ok(7) })?;
//!     pool.join().await;
//!     pool.stop().await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod item;
mod manager;
mod processor;
mod queue;
mod scheduler;
mod sink;
mod worker;

// Re-export main types
pub use config::{
    DuplicateJobPolicy, SchedulerConfig, SchedulerConfigBuilder, WorkerConfig, WorkerConfigBuilder,
};
pub use error::{HandlerError, HandlerErrorKind, Result, WorksetError};
pub use item::{ExecutionOutcome, WorkItem, WorkItemId};
pub use manager::{PoolState, WorkerManager};
pub use processor::{
    handler_fn, required_arg, FnHandler, Handler, HandlerRegistry, Payload, TaskDescriptor,
    TaskProcessor, TaskReport,
};
pub use queue::WorkQueue;
pub use scheduler::{JobId, JobOutcome, JobScheduler, SchedulerState};
pub use sink::{ResultSink, SharedSink};
pub use worker::WorkerState;
