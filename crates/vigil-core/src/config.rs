//! Vigil configuration types and loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::app::executor::ExecutorConfig;
use crate::app::hooks::HookRecorderConfig;
use crate::app::scheduler::SchedulerConfig;
use crate::domain::{DEFAULT_PRIORITY, DeadCheckpointPolicy, QueueName};
use crate::queue::{QueueLimits, RetryPolicy};

/// Project-local config file picked up when no path is given.
pub const LOCAL_CONFIG_FILE: &str = "vigil.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main Vigil configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VigilConfig {
    pub scheduler: SchedulerSection,
    pub executor: ExecutorSection,
    pub retry: RetrySection,
    pub queue: QueueSection,
    pub checkpoints: CheckpointSection,
    pub hooks: HooksSection,
    pub storage: StorageSection,

    /// Log level used when neither the CLI flag nor RUST_LOG decide
    pub log_level: Option<String>,
}

impl VigilConfig {
    /// Load configuration with fallback chain: explicit path, `./vigil.yml`, defaults
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => warn!("Failed to load config from {}: {}", local_config.display(), e),
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.scheduler.batch_size == 0 {
            return invalid("scheduler.batch-size must be at least 1");
        }
        if self.scheduler.batch_size > self.queue.max_payload {
            return invalid("scheduler.batch-size must not exceed queue.max-payload");
        }
        if self.scheduler.interval_secs == 0 {
            return invalid("scheduler.interval-secs must be at least 1");
        }
        if self.scheduler.queue.trim().is_empty() {
            return invalid("scheduler.queue must not be empty");
        }
        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be at least 1");
        }
        if self.queue.max_payload == 0 {
            return invalid("queue.max-payload must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max-attempts must be at least 1");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max-delay-ms must not be below retry.base-delay-ms");
        }
        if self.executor.max_execution_secs == 0 {
            return invalid("executor.max-execution-secs must be at least 1");
        }
        if self.checkpoints.retain_per_task == 0 {
            return invalid("checkpoints.retain-per-task must be at least 1");
        }
        if self.hooks.buffer_capacity == 0 {
            return invalid("hooks.buffer-capacity must be at least 1");
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.scheduler.interval(),
            staleness_threshold: self.scheduler.threshold(),
            batch_size: self.scheduler.batch_size,
            default_priority: self.scheduler.default_priority,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: self.executor.poll_interval(),
            max_execution: self.executor.max_execution(),
            grace_period: self.executor.grace_period(),
            dead_policy: self.checkpoints.dead_policy,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry.base_delay(),
            max_delay: self.retry.max_delay(),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            capacity: self.queue.capacity,
            max_payload: self.queue.max_payload,
        }
    }

    pub fn hook_recorder_config(&self) -> HookRecorderConfig {
        HookRecorderConfig {
            buffer_capacity: self.hooks.buffer_capacity,
            flush_interval: self.hooks.flush_interval(),
            shutdown_timeout: self.hooks.shutdown_timeout(),
        }
    }
}

/// Staleness scan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerSection {
    pub interval_secs: u64,
    pub staleness_threshold_secs: u64,
    pub batch_size: usize,
    pub default_priority: i32,

    /// Queue the scheduler submits to
    pub queue: String,

    /// Start paused
    pub paused: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            staleness_threshold_secs: 86_400,
            batch_size: 3,
            default_priority: DEFAULT_PRIORITY,
            queue: "analysis".to_string(),
            paused: false,
        }
    }
}

impl SchedulerSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn threshold(&self) -> chrono::Duration {
        let secs = i64::try_from(self.staleness_threshold_secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }

    pub fn queue_name(&self) -> QueueName {
        QueueName::new(self.queue.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutorSection {
    pub poll_interval_ms: u64,
    pub max_execution_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_execution_secs: 900,
            grace_period_secs: 30,
        }
    }
}

impl ExecutorSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_delay_ms: 300_000,
            max_attempts: 5,
        }
    }
}

impl RetrySection {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueSection {
    /// Max non-terminal tasks per queue
    pub capacity: usize,

    /// Max entity ids per task
    pub max_payload: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_payload: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CheckpointSection {
    pub retain_per_task: usize,
    pub dead_policy: DeadCheckpointPolicy,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            retain_per_task: 3,
            dead_policy: DeadCheckpointPolicy::RetainLatest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HooksSection {
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,

    /// Bound on the final hook drain at shutdown
    pub shutdown_timeout_ms: u64,

    /// Events kept by the in-memory sink
    pub max_retained: usize,
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            flush_interval_ms: 500,
            shutdown_timeout_ms: 5000,
            max_retained: 10_000,
        }
    }
}

impl HooksSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageSection {
    /// Directory for task/checkpoint files and the hook log; in-memory when unset
    pub dir: Option<PathBuf>,
}
