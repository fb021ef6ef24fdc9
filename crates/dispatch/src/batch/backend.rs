//! BatchBackend trait definition
//!
//! The execution backend runs tasks on a pool of compute nodes. Jobs group
//! tasks and are bound to one pool.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type for backend operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Job, pool or task not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Resource already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Too many tasks in one submission
    #[error("submission of {count} tasks exceeds the limit of {max}")]
    RequestTooLarge { count: usize, max: usize },

    /// Request throttled by the service
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Network or service error
    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Whether the error means the resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Active,
    Disabling,
    Disabled,
    Enabling,
    Terminating,
    Completed,
    Deleting,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disabling => write!(f, "disabling"),
            Self::Disabled => write!(f, "disabled"),
            Self::Enabling => write!(f, "enabling"),
            Self::Terminating => write!(f, "terminating"),
            Self::Completed => write!(f, "completed"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

/// What the backend does once every task of a job has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnAllTasksComplete {
    NoAction,
    TerminateJob,
}

/// Job as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: String,
    pub pool_id: String,
    pub state: JobState,
}

/// Job creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: String,
    pub pool_id: String,
    pub on_all_tasks_complete: OnAllTasksComplete,
}

/// File downloaded to the node before the task starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFile {
    pub http_url: String,
    pub file_path: String,
}

/// Environment variable set for the task process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSetting {
    pub name: String,
    pub value: String,
}

impl EnvironmentSetting {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Task submission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub command_line: String,
    pub resource_files: Vec<ResourceFile>,
    pub environment: Vec<EnvironmentSetting>,
    pub max_wall_clock_time: Duration,
    pub max_task_retry_count: u32,
}

/// Outcome of one task in a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAddStatus {
    Success,
    ClientError,
    ServerError,
}

/// Structured error returned for a rejected task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAddError {
    pub code: String,
    pub message: String,
    /// Additional key/value details
    pub values: Vec<(String, String)>,
}

impl std::fmt::Display for TaskAddError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for (key, value) in &self.values {
            write!(f, "; {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Per-task result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAddResult {
    pub task_id: String,
    pub status: TaskAddStatus,
    pub error: Option<TaskAddError>,
}

/// Pool size as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub id: String,
    /// Task slots per compute node
    pub max_tasks_per_node: u32,
    pub current_dedicated_nodes: u32,
    pub current_low_priority_nodes: u32,
}

impl PoolInfo {
    /// Total task slots across all nodes
    pub fn max_tasks_per_pool(&self) -> u32 {
        self.max_tasks_per_node.saturating_mul(
            self.current_dedicated_nodes
                .saturating_add(self.current_low_priority_nodes),
        )
    }
}

/// Task counts of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobTaskCounts {
    pub active: u32,
    pub running: u32,
    pub completed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Active,
    Running,
    Completed,
}

/// Why a completed task failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailureInfo {
    pub category: String,
    pub code: String,
    pub message: String,
}

/// Task as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub state: TaskState,
    pub environment: Vec<EnvironmentSetting>,
    pub exit_code: Option<i32>,
    pub failure: Option<TaskFailureInfo>,
}

impl TaskInfo {
    /// Value of an environment setting
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.value.as_str())
    }
}

/// One page of a job listing
#[derive(Debug, Clone, Default)]
pub struct JobPage {
    pub jobs: Vec<JobInfo>,
    pub next_link: Option<String>,
}

/// One page of a task listing
#[derive(Debug, Clone, Default)]
pub struct TaskPage {
    pub tasks: Vec<TaskInfo>,
    pub next_link: Option<String>,
}

/// Execution backend
///
/// Implementations must be thread-safe; submissions for different chunks may
/// run concurrently.
#[async_trait]
pub trait BatchBackend: Send + Sync + 'static {
    /// Get a job; `BackendError::NotFound` if it does not exist
    async fn get_job(&self, job_id: &str) -> Result<JobInfo, BackendError>;

    /// Create a job
    async fn create_job(&self, spec: JobSpec) -> Result<(), BackendError>;

    /// Terminate a job; running tasks are stopped
    async fn terminate_job(&self, job_id: &str) -> Result<(), BackendError>;

    /// Submit a collection of tasks (at most 100 per call)
    async fn add_task_collection(
        &self,
        job_id: &str,
        tasks: Vec<TaskSpec>,
    ) -> Result<Vec<TaskAddResult>, BackendError>;

    /// Get a pool
    async fn get_pool(&self, pool_id: &str) -> Result<PoolInfo, BackendError>;

    /// List active jobs bound to a pool
    async fn list_jobs(
        &self,
        pool_id: &str,
        next_link: Option<&str>,
    ) -> Result<JobPage, BackendError>;

    /// Get task counts of a job
    async fn get_task_counts(&self, job_id: &str) -> Result<JobTaskCounts, BackendError>;

    /// List completed tasks of a job whose execution failed
    async fn list_failed_tasks(
        &self,
        job_id: &str,
        next_link: Option<&str>,
    ) -> Result<TaskPage, BackendError>;
}
