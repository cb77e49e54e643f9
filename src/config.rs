//! Configuration types for the worker pool and the job scheduler.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WorksetError};

/// What `JobScheduler::add_job` does when the same handler is added twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateJobPolicy {
    /// Every call appends a new entry; the handler runs once per entry.
    #[default]
    Allow,
    /// The existing entry keeps its position and takes the new payload.
    Replace,
}

/// Configuration for the WorkerManager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a worker waits on the queue before re-checking its stop flag.
    #[serde(with = "duration_millis")]
    pub fetch_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            fetch_timeout: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Parse a config from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the config can drive a worker pool.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(WorksetError::Config(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(WorksetError::Config(
                "fetch_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Configuration for the JobScheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between the end of one cycle and the start of the next.
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Policy for re-adding a handler that is already scheduled.
    pub duplicate_policy: DuplicateJobPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            duplicate_policy: DuplicateJobPolicy::Allow,
        }
    }
}

impl SchedulerConfig {
    /// Create a new builder.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    /// Parse a config from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the config can drive a scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(WorksetError::Config(
                "interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for SchedulerConfig.
#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interval between cycles.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the duplicate job policy.
    pub fn duplicate_policy(mut self, policy: DuplicateJobPolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    /// Build the SchedulerConfig.
    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

/// Serde module for Duration as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
