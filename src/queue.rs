//! Unbounded FIFO work queue shared by a pool of workers.
//!
//! The queue tracks how many items were `put` but not yet acknowledged with
//! `mark_done`, so callers can wait for the backlog to drain while workers
//! keep running.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Result, WorksetError};

/// Thread-safe FIFO with timed retrieval and drain tracking.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // The deque is never left half-modified, so a poisoned lock is still usable.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an item. Never blocks.
    pub fn put(&self, item: T) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Put an item that was already taken back at the head of the queue.
    ///
    /// The outstanding count is unchanged: the item still owes a `mark_done`.
    pub fn requeue_front(&self, item: T) {
        self.lock().push_front(item);
        self.available.notify_one();
    }

    /// Take the next item without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait up to `timeout` for the next item.
    ///
    /// Returns `None` when the timeout elapses with the queue still empty.
    pub async fn take(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `put` cannot slip between.
            notified.as_mut().enable();

            if let Some(item) = self.try_take() {
                return Some(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_take();
            }
        }
    }

    /// Acknowledge that one taken item has been fully processed.
    pub fn mark_done(&self) -> Result<()> {
        let previous = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| {
                WorksetError::Queue("mark_done called more times than items were put".to_string())
            })?;

        if previous == 1 {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    /// Wait until every item that was `put` has been acknowledged.
    pub async fn wait_until_empty(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }

            drained.await;
        }
    }

    /// Number of items waiting to be taken.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check whether no items are waiting to be taken.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of items put but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}
