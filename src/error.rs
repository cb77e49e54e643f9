//! Error types for the workset library.

use std::fmt;

use thiserror::Error;

/// The main error type for the workset library.
#[derive(Error, Debug)]
pub enum WorksetError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No handler is registered for the requested task type.
    #[error("No handler registered for task type: {0}")]
    HandlerNotFound(String),

    /// A handler invoked through the task processor failed.
    #[error("Handler for task '{task}' failed: {error}")]
    Handler { task: String, error: HandlerError },

    /// Work queue accounting error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Worker pool lifecycle error.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Job scheduler lifecycle error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using WorksetError.
pub type Result<T> = std::result::Result<T, WorksetError>;

/// How a unit of work failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// The callable returned an error.
    Failed,
    /// The callable panicked.
    Panicked,
}

/// Failure captured from a handler, work item or job.
///
/// This is data, not control flow: workers and the scheduler hand it to a
/// result sink instead of propagating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Error message.
    pub message: String,
    /// Whether the callable failed or panicked.
    pub kind: HandlerErrorKind,
}

impl HandlerError {
    /// Create an error for a callable that returned a failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: HandlerErrorKind::Failed,
        }
    }

    /// Create an error for a callable that panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: HandlerErrorKind::Panicked,
        }
    }

    /// Build a panic error from the payload returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::panicked(message)
    }

    /// Check whether the callable panicked.
    pub fn is_panic(&self) -> bool {
        self.kind == HandlerErrorKind::Panicked
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            HandlerErrorKind::Failed => write!(f, "{}", self.message),
            HandlerErrorKind::Panicked => write!(f, "panicked: {}", self.message),
        }
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::failed(err.to_string())
    }
}
