//! Named handler dispatch.
//!
//! A [`TaskProcessor`] looks up the handler registered for a task's type,
//! invokes it with the task's payload as named arguments, and reports how long
//! the call took. It adds no concurrency of its own: the handler runs on the
//! caller's task. To run tasks in parallel, submit `process` calls to a
//! [`WorkerManager`](crate::WorkerManager).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::error::{HandlerError, Result, WorksetError};

/// Named arguments passed to a handler.
pub type Payload = serde_json::Map<String, Value>;

/// Capability interface implemented by every task handler and scheduled job.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler with its named arguments.
    async fn invoke(&self, payload: Payload) -> std::result::Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    async fn invoke(&self, payload: Payload) -> std::result::Result<Value, HandlerError> {
        (self)(payload).await
    }
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Payload) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn invoke(&self, payload: Payload) -> std::result::Result<Value, HandlerError> {
        (self.0)(payload)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Payload) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

/// Read a required named argument from a payload.
pub fn required_arg<T: DeserializeOwned>(
    payload: &Payload,
    name: &str,
) -> std::result::Result<T, HandlerError> {
    let value = payload
        .get(name)
        .ok_or_else(|| HandlerError::failed(format!("missing argument '{}'", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| HandlerError::failed(format!("invalid argument '{}': {}", name, e)))
}

/// Registry mapping task type names to handlers.
///
/// One handler per name; registering a name again replaces the old handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the handler for `name`.
    pub fn register(&self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.register_arc(name, Arc::new(handler));
    }

    /// Install or replace the handler for `name` from a shared handle.
    pub fn register_arc(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let name = name.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), handler)
            .is_some();
        tracing::debug!(task = %name, replaced, "Registered handler");
    }

    /// Remove the handler for `name`. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            tracing::debug!(task = %name, "Unregistered handler");
        }
        removed
    }

    /// Get the handler registered for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered task type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A task to dispatch: its type name and named arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task type, used to look up the handler.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Named arguments for the handler.
    #[serde(default)]
    pub payload: Payload,
}

impl TaskDescriptor {
    /// Create a descriptor with an empty payload.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: Payload::new(),
        }
    }

    /// Add a named argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Parse a descriptor from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Result of processing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task type that was processed.
    pub task: String,
    /// Wall-clock time spent in the handler.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Value returned by the handler.
    pub result: Value,
}

/// Dispatches tasks to registered handlers.
#[derive(Default)]
pub struct TaskProcessor {
    registry: Arc<HandlerRegistry>,
}

impl TaskProcessor {
    /// Create a processor with its own empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a processor that shares an existing registry.
    pub fn with_registry(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this processor dispatches through.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Install or replace the handler for `name`.
    pub fn register(&self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.registry.register(name, handler);
    }

    /// Remove the handler for `name`, if any.
    pub fn unregister(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Run the handler for `task` and report its result and duration.
    ///
    /// Fails with [`WorksetError::HandlerNotFound`] before running anything
    /// if no handler is registered for the task type.
    pub async fn process(&self, task: &TaskDescriptor) -> Result<TaskReport> {
        let name = task.task_type.as_str();
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| WorksetError::HandlerNotFound(name.to_string()))?;

        tracing::debug!(task = %name, "Processing task");

        let started = Instant::now();
        let outcome = handler.invoke(task.payload.clone()).await;
        let duration = started.elapsed();

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    task = %name,
                    duration_ms = duration.as_millis() as u64,
                    "Task processed"
                );
                Ok(TaskReport {
                    task: name.to_string(),
                    duration,
                    result,
                })
            }
            Err(error) => {
                tracing::warn!(task = %name, error = %error, "Task handler failed");
                Err(WorksetError::Handler {
                    task: name.to_string(),
                    error,
                })
            }
        }
    }

    /// Parse a JSON task descriptor and process it.
    pub async fn process_json(&self, json: &str) -> Result<TaskReport> {
        let task = TaskDescriptor::from_json(json)?;
        self.process(&task).await
    }
}

/// Serde module for Duration as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
