//! Work items and their execution outcomes.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use uuid::Uuid;

use crate::error::HandlerError;

/// Unique identifier for a submitted work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    /// Generate a new random WorkItemId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type BoxedWork<T> =
    Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<T, HandlerError>> + Send>;

/// One unit of submitted work: a callable with its arguments already bound.
pub struct WorkItem<T> {
    id: WorkItemId,
    work: BoxedWork<T>,
}

impl<T: Send + 'static> WorkItem<T> {
    /// Wrap an async callable.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, HandlerError>> + Send + 'static,
    {
        Self {
            id: WorkItemId::new(),
            work: Box::new(move || f().boxed()),
        }
    }

    /// Wrap a synchronous callable that runs on tokio's blocking pool.
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> std::result::Result<T, HandlerError> + Send + 'static,
    {
        Self::new(move || async move {
            match tokio::task::spawn_blocking(f).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(HandlerError::from_panic(e.into_panic())),
                Err(e) => Err(HandlerError::failed(e.to_string())),
            }
        })
    }

    /// The item's id.
    pub fn id(&self) -> WorkItemId {
        self.id
    }

    /// Run the callable, turning a panic into a `HandlerError`.
    pub async fn execute(self) -> std::result::Result<T, HandlerError> {
        let work = self.work;
        match AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::from_panic(panic)),
        }
    }
}

impl<T> std::fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("id", &self.id).finish_non_exhaustive()
    }
}

/// What happened when a worker executed one work item.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome<T> {
    /// The item this outcome belongs to.
    pub id: WorkItemId,
    /// The worker that executed the item.
    pub worker_id: usize,
    /// The callable's return value or its captured failure.
    pub result: std::result::Result<T, HandlerError>,
    /// Wall-clock execution time.
    pub elapsed: Duration,
}

impl<T> ExecutionOutcome<T> {
    /// Check whether the item succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Consume the outcome, keeping only the result.
    pub fn into_result(self) -> std::result::Result<T, HandlerError> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerErrorKind;

    #[tokio::test]
    async fn test_execute_success() {
        let item = WorkItem::new(|| async { Ok::<_, HandlerError>(21 * 2) });
        assert_eq!(item.execute().await, Ok(42));
    }

    #[tokio::test]
    async fn test_execute_captures_error() {
        let item: WorkItem<u32> =
            WorkItem::new(|| async { Err(HandlerError::failed("bad input")) });
        let err = item.execute().await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Failed);
        assert_eq!(err.message, "bad input");
    }

    #[tokio::test]
    async fn test_execute_captures_panic() {
        let item: WorkItem<u32> = WorkItem::new(|| async { panic!("exploded") });
        let err = item.execute().await.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.message, "exploded");
    }

    #[tokio::test]
    async fn test_execute_captures_panic_before_future() {
        let item: WorkItem<u32> = WorkItem::new(|| -> futures::future::Ready<_> {
            panic!("panicked while building the future")
        });
        assert!(item.execute().await.unwrap_err().is_panic());
    }

    #[tokio::test]
    async fn test_blocking_item() {
        let item = WorkItem::blocking(|| Ok((1..=4).product::<u64>()));
        assert_eq!(item.execute().await, Ok(24));

        let item: WorkItem<u64> = WorkItem::blocking(|| panic!("blocking boom"));
        let err = item.execute().await.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.message, "blocking boom");
    }

    #[test]
    fn test_item_ids_are_unique() {
        let a = WorkItem::new(|| async { Ok::<_, HandlerError>(()) });
        let b = WorkItem::new(|| async { Ok::<_, HandlerError>(()) });
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_outcome_helpers() {
        let outcome = ExecutionOutcome {
            id: WorkItemId::new(),
            worker_id: 0,
            result: Err::<u32, _>(HandlerError::failed("nope")),
            elapsed: Duration::from_millis(3),
        };
        assert!(!outcome.is_success());
        assert!(outcome.into_result().is_err());
    }
}
