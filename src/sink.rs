//! Result sinks receive outcomes from workers and scheduler cycles.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Receiver for outcomes produced off the caller's task.
///
/// Sinks are called concurrently from every worker of a pool, so
/// implementations synchronize their own state.
pub trait ResultSink<O>: Send + Sync {
    /// Accept one outcome.
    fn deliver(&self, outcome: O);
}

impl<O, F> ResultSink<O> for F
where
    F: Fn(O) + Send + Sync,
{
    fn deliver(&self, outcome: O) {
        self(outcome)
    }
}

/// Sink shared between workers.
pub type SharedSink<O> = Arc<dyn ResultSink<O>>;

/// Deliver an outcome, containing a panic raised by the sink itself.
///
/// Returns false if the sink panicked.
pub(crate) fn deliver_guarded<O>(sink: &dyn ResultSink<O>, outcome: O) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(outcome))) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!("Result sink panicked while delivering an outcome");
            false
        }
    }
}
