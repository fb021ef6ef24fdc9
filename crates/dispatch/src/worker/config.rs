//! Worker configuration
//!
//! Read once at startup from environment variables. Unset variables fall back
//! to defaults; set but malformed variables are errors.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::DispatcherConfig;
use crate::load::LoadConfig;
use crate::persistence::{duration_millis, QueueConfig};
use crate::reliability::RetryPolicy;
use crate::selection::SelectorConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// Values parse but do not make sense together
    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Job to submit to (or base id when uniquified)
    pub job_id: String,

    /// Append a random token to newly created job ids
    pub uniquify_job_id: bool,

    /// Time between control cycles
    #[serde(with = "duration_millis")]
    pub add_tasks_interval: Duration,

    /// Stop admitting work after this long and drain the pool
    #[serde(with = "duration_millis")]
    pub max_wall_clock: Duration,

    /// Pool poll interval while draining
    #[serde(with = "duration_millis")]
    pub drain_poll_interval: Duration,

    /// Draining ends once active plus running tasks drop to this
    pub drain_idle_threshold: u32,

    /// Parallelism of queue deletes and dead-letter moves
    pub max_parallel_queue_ops: usize,

    /// Terminate the job before exiting
    pub terminate_job_on_exit: bool,

    /// Run a single cycle then terminate
    pub run_once: bool,

    pub load: LoadConfig,
    pub queue: QueueConfig,
    pub selector: SelectorConfig,
    pub dispatcher: DispatcherConfig,

    /// Retry policy for work request write conflicts
    pub conflict_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_id: "scan-job".to_string(),
            uniquify_job_id: true,
            add_tasks_interval: Duration::from_secs(15),
            max_wall_clock: Duration::from_secs(2 * 60 * 60),
            drain_poll_interval: Duration::from_secs(5),
            drain_idle_threshold: 1,
            max_parallel_queue_ops: 16,
            terminate_job_on_exit: false,
            run_once: false,
            load: LoadConfig::default(),
            queue: QueueConfig::default(),
            selector: SelectorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            conflict_retry: RetryPolicy::exponential(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for a job and pool
    pub fn new(job_id: impl Into<String>, pool_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            dispatcher: DispatcherConfig::new(pool_id),
            ..Default::default()
        }
    }

    /// Load from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(job_id) = env.string("JOB_ID") {
            config.job_id = job_id;
        }
        if let Some(pool_id) = env.string("POOL_ID") {
            config.dispatcher.pool_id = pool_id;
        }
        if let Some(command_line) = env.string("TASK_COMMAND_LINE") {
            config.dispatcher.command_line = command_line;
        }
        if let Some(v) = env.flag("UNIQUIFY_JOB_ID")? {
            config.uniquify_job_id = v;
        }
        if let Some(v) = env.flag("TERMINATE_JOB_ON_EXIT")? {
            config.terminate_job_on_exit = v;
        }
        if let Some(v) = env.flag("RUN_ONCE")? {
            config.run_once = v;
        }

        if let Some(secs) = env.parse::<u64>("ADD_TASKS_INTERVAL_SECS")? {
            config.add_tasks_interval = Duration::from_secs(secs);
        }
        if let Some(hours) = env.parse::<f64>("MAX_WALL_CLOCK_HOURS")? {
            config.max_wall_clock = hours_to_duration("MAX_WALL_CLOCK_HOURS", hours)?;
        }
        if let Some(secs) = env.parse::<u64>("DRAIN_POLL_INTERVAL_SECS")? {
            config.drain_poll_interval = Duration::from_secs(secs);
        }
        if let Some(v) = env.parse::<u32>("DRAIN_IDLE_THRESHOLD")? {
            config.drain_idle_threshold = v;
        }
        if let Some(v) = env.parse::<usize>("MAX_PARALLEL_QUEUE_OPS")? {
            config.max_parallel_queue_ops = v;
        }

        if let Some(ratio) = env.parse::<f64>("ACTIVE_TO_RUNNING_TASKS_RATIO")? {
            config.load.active_to_running_ratio = ratio;
        }

        if let Some(minutes) = env.parse::<u64>("TASK_TIMEOUT_MINUTES")? {
            config.dispatcher.task_timeout = Duration::from_secs(minutes * 60);
        }
        if let Some(v) = env.parse::<u32>("MAX_TASK_RETRY_COUNT")? {
            config.dispatcher.max_task_retry_count = v;
        }

        if let Some(v) = env.parse::<u32>("MAX_RETRY_COUNT")? {
            config.selector.max_retry_count = v;
        }
        if let Some(minutes) = env.parse::<u64>("RETRY_INTERVAL_MINUTES")? {
            config.selector.retry_interval = Duration::from_secs(minutes * 60);
        }

        if let Some(v) = env.parse::<u32>("MAX_DEQUEUE_COUNT")? {
            config.queue.max_dequeue_count = v;
        }
        if let Some(secs) = env.parse::<u64>("MESSAGE_VISIBILITY_TIMEOUT_SECS")? {
            config.queue.visibility_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Reject values that would stall or break the control loop
    pub fn validate(&self) -> Result<(), ConfigError> {
        let inconsistent = |msg: &str| Err(ConfigError::Inconsistent(msg.to_string()));

        if self.job_id.trim().is_empty() {
            return inconsistent("job id must not be empty");
        }
        if self.dispatcher.pool_id.trim().is_empty() {
            return inconsistent("pool id must not be empty");
        }
        if self.add_tasks_interval.is_zero() {
            return inconsistent("add tasks interval must be positive");
        }
        if self.drain_poll_interval.is_zero() {
            return inconsistent("drain poll interval must be positive");
        }
        if self.max_wall_clock.is_zero() {
            return inconsistent("max wall clock time must be positive");
        }
        if !(self.load.active_to_running_ratio.is_finite() && self.load.active_to_running_ratio > 0.0)
        {
            return inconsistent("active to running tasks ratio must be positive");
        }
        if self.selector.max_retry_count == 0 {
            return inconsistent("max retry count must be at least 1");
        }
        if self.queue.max_dequeue_count == 0 {
            return inconsistent("max dequeue count must be at least 1");
        }
        if self.max_parallel_queue_ops == 0 {
            return inconsistent("max parallel queue operations must be at least 1");
        }
        if self.dispatcher.task_timeout.is_zero() {
            return inconsistent("task timeout must be positive");
        }
        Ok(())
    }

    /// Set the job id
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Set whether new job ids get a random suffix
    pub fn with_uniquify_job_id(mut self, uniquify: bool) -> Self {
        self.uniquify_job_id = uniquify;
        self
    }

    /// Set the control cycle interval
    pub fn with_add_tasks_interval(mut self, interval: Duration) -> Self {
        self.add_tasks_interval = interval;
        self
    }

    /// Set the restart window
    pub fn with_max_wall_clock(mut self, max: Duration) -> Self {
        self.max_wall_clock = max;
        self
    }

    /// Set the drain poll interval
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Set single-cycle mode
    pub fn with_run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    /// Terminate the job on exit
    pub fn with_terminate_job_on_exit(mut self, terminate: bool) -> Self {
        self.terminate_job_on_exit = terminate;
        self
    }

    /// Set the load generator configuration
    pub fn with_load(mut self, load: LoadConfig) -> Self {
        self.load = load;
        self
    }

    /// Set the queue configuration
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the selector configuration
    pub fn with_selector(mut self, selector: SelectorConfig) -> Self {
        self.selector = selector;
        self
    }

    /// Set the dispatcher configuration
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the conflict retry policy
    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }
}

fn hours_to_duration(name: &'static str, hours: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(hours * 3600.0).map_err(|e| ConfigError::Invalid {
        name,
        value: hours.to_string(),
        reason: e.to_string(),
    })
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &'static str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn flag(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(name)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    name,
                    value,
                    reason: "expected a boolean".to_string(),
                }),
            })
            .transpose()
    }
}
