//! Task dispatch to the execution backend
//!
//! Owns job lifecycle (create-if-not-exists, termination), chunked task
//! submission and pool metrics.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backend::*;
use crate::load::PoolMetrics;
use crate::persistence::{duration_millis, QueueMessage, RequestMessage};

/// Backend limit on tasks per submission call
pub const MAX_TASKS_PER_SUBMISSION: usize = 100;

/// Environment variable carrying the queue message body into the task
pub const TASK_ARGUMENTS_ENV: &str = "TASK_ARGUMENTS";

/// Environment variable carrying the job id into the task
pub const JOB_ID_ENV: &str = "JOB_ID";

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The job exists but no longer accepts tasks
    #[error("job {job_id} is not active (state: {state})")]
    JobNotActive { job_id: String, state: JobState },

    /// Backend call failed
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
}

impl DispatchError {
    fn backend(operation: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::Backend { operation, source }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Pool the job is bound to
    pub pool_id: String,

    /// Command run by every task
    pub command_line: String,

    /// Files staged on the node for every task
    #[serde(default)]
    pub resource_files: Vec<ResourceFile>,

    /// Environment settings shared by every task
    #[serde(default)]
    pub environment: Vec<EnvironmentSetting>,

    /// Wall-clock limit of a single task
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    /// Backend-side retries of a failed task
    pub max_task_retry_count: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_id: "scan-pool".to_string(),
            command_line: "/bin/sh -c \"scan-runner\"".to_string(),
            resource_files: vec![],
            environment: vec![],
            task_timeout: Duration::from_secs(10 * 60),
            max_task_retry_count: 0,
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration for a pool
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            ..Default::default()
        }
    }

    /// Set the task command line
    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    /// Add a resource file
    pub fn with_resource_file(mut self, file: ResourceFile) -> Self {
        self.resource_files.push(file);
        self
    }

    /// Add an environment setting
    pub fn with_environment(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push(EnvironmentSetting::new(name, value));
        self
    }

    /// Set the task timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Submission outcome of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTaskState {
    Queued,
    Failed,
}

/// Result of submitting one message as a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTask {
    pub id: String,
    /// Id of the queue message the task was built from
    pub correlation_id: String,
    pub state: JobTaskState,
    pub error: Option<String>,
}

impl JobTask {
    fn queued(id: String, correlation_id: String) -> Self {
        Self {
            id,
            correlation_id,
            state: JobTaskState::Queued,
            error: None,
        }
    }

    fn failed(id: String, correlation_id: String, error: String) -> Self {
        Self {
            id,
            correlation_id,
            state: JobTaskState::Failed,
            error: Some(error),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.state == JobTaskState::Queued
    }
}

/// A task that completed with a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub task_id: String,
    /// Work request the task ran, if it could be recovered from the task
    pub request_id: Option<String>,
    pub description: String,
}

/// Submits work to the execution backend
pub struct TaskDispatcher {
    backend: Arc<dyn BatchBackend>,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    /// Create a new dispatcher
    pub fn new(backend: Arc<dyn BatchBackend>, config: DispatcherConfig) -> Self {
        Self { backend, config }
    }

    /// Dispatcher configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Resolve the job to submit to, creating it if needed
    ///
    /// An active job is reused as-is. A missing job is created, with a random
    /// suffix when `uniquify` is set. A job in any other state is an error.
    #[instrument(skip(self))]
    pub async fn create_job_if_not_exists(
        &self,
        job_id: &str,
        uniquify: bool,
    ) -> Result<String, DispatchError> {
        match self.backend.get_job(job_id).await {
            Ok(job) if job.state == JobState::Active => {
                debug!(job_id = %job.id, "Reusing active job");
                Ok(job.id)
            }
            Ok(job) => Err(DispatchError::JobNotActive {
                job_id: job.id,
                state: job.state,
            }),
            Err(e) if e.is_not_found() => {
                let new_id = if uniquify {
                    format!("{}-{}", job_id, random_token(8))
                } else {
                    job_id.to_string()
                };

                self.backend
                    .create_job(JobSpec {
                        id: new_id.clone(),
                        pool_id: self.config.pool_id.clone(),
                        on_all_tasks_complete: OnAllTasksComplete::TerminateJob,
                    })
                    .await
                    .map_err(DispatchError::backend("create job"))?;

                info!(job_id = %new_id, pool_id = %self.config.pool_id, "Created job");
                Ok(new_id)
            }
            Err(e) => Err(DispatchError::Backend {
                operation: "get job",
                source: e,
            }),
        }
    }

    /// Submit one task per message
    ///
    /// Messages are submitted in chunks of at most
    /// [`MAX_TASKS_PER_SUBMISSION`], all chunks in parallel. Failures are
    /// reported per task and never abort the call.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn create_tasks(&self, job_id: &str, messages: &[QueueMessage]) -> Vec<JobTask> {
        // Each submission owns its inputs so the joined future stays Send
        let submissions: Vec<_> = messages
            .chunks(MAX_TASKS_PER_SUBMISSION)
            .map(|chunk| {
                let specs: Vec<TaskSpec> = chunk
                    .iter()
                    .map(|message| self.task_spec(job_id, message))
                    .collect();
                let correlation_ids: Vec<String> = chunk.iter().map(|m| m.id.clone()).collect();
                submit_chunk(
                    Arc::clone(&self.backend),
                    job_id.to_string(),
                    specs,
                    correlation_ids,
                )
            })
            .collect();

        let tasks: Vec<JobTask> = join_all(submissions).await.into_iter().flatten().collect();

        let failed = tasks.iter().filter(|t| !t.is_queued()).count();
        debug!(queued = tasks.len() - failed, failed, "Submitted tasks");
        tasks
    }

    fn task_spec(&self, job_id: &str, message: &QueueMessage) -> TaskSpec {
        let mut environment = self.config.environment.clone();
        environment.push(EnvironmentSetting::new(TASK_ARGUMENTS_ENV, &message.body));
        environment.push(EnvironmentSetting::new(JOB_ID_ENV, job_id));

        TaskSpec {
            id: format!("{}_{}", message.id, Uuid::now_v7().simple()),
            command_line: self.config.command_line.clone(),
            resource_files: self.config.resource_files.clone(),
            environment,
            max_wall_clock_time: self.config.task_timeout,
            max_task_retry_count: self.config.max_task_retry_count,
        }
    }

    /// Current pool occupancy across all active jobs bound to the pool
    #[instrument(skip(self), fields(pool_id = %self.config.pool_id))]
    pub async fn get_pool_metrics(&self) -> Result<PoolMetrics, DispatchError> {
        let pool = self
            .backend
            .get_pool(&self.config.pool_id)
            .await
            .map_err(DispatchError::backend("get pool"))?;

        let mut metrics = PoolMetrics {
            pool_id: pool.id.clone(),
            max_tasks_per_pool: pool.max_tasks_per_pool(),
            active_tasks: 0,
            running_tasks: 0,
        };

        let mut next_link: Option<String> = None;
        loop {
            let page = self
                .backend
                .list_jobs(&self.config.pool_id, next_link.as_deref())
                .await
                .map_err(DispatchError::backend("list jobs"))?;

            for job in &page.jobs {
                let counts = self
                    .backend
                    .get_task_counts(&job.id)
                    .await
                    .map_err(DispatchError::backend("get task counts"))?;
                metrics.active_tasks += counts.active;
                metrics.running_tasks += counts.running;
            }

            next_link = page.next_link;
            if next_link.is_none() {
                break;
            }
        }

        Ok(metrics)
    }

    /// Terminate a job
    pub async fn terminate_job(&self, job_id: &str) -> Result<(), DispatchError> {
        self.backend
            .terminate_job(job_id)
            .await
            .map_err(DispatchError::backend("terminate job"))?;
        info!(%job_id, "Terminated job");
        Ok(())
    }

    /// Tasks of a job that completed with a failure
    #[instrument(skip(self))]
    pub async fn get_failed_tasks(&self, job_id: &str) -> Result<Vec<FailedTask>, DispatchError> {
        let mut failed = Vec::new();
        let mut next_link: Option<String> = None;

        loop {
            let page = self
                .backend
                .list_failed_tasks(job_id, next_link.as_deref())
                .await
                .map_err(DispatchError::backend("list failed tasks"))?;

            failed.extend(page.tasks.iter().map(failed_task));

            next_link = page.next_link;
            if next_link.is_none() {
                break;
            }
        }

        Ok(failed)
    }
}

async fn submit_chunk(
    backend: Arc<dyn BatchBackend>,
    job_id: String,
    specs: Vec<TaskSpec>,
    correlation_ids: Vec<String>,
) -> Vec<JobTask> {
    let task_ids: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();

    let results = match backend.add_task_collection(&job_id, specs).await {
        Ok(results) => results,
        Err(e) => {
            warn!(%job_id, tasks = task_ids.len(), error = %e, "Task submission failed");
            let error = e.to_string();
            return task_ids
                .into_iter()
                .zip(correlation_ids)
                .map(|(id, correlation_id)| JobTask::failed(id, correlation_id, error.clone()))
                .collect();
        }
    };

    task_ids
        .into_iter()
        .zip(correlation_ids)
        .map(|(id, correlation_id)| match results.iter().find(|r| r.task_id == id) {
            Some(r) if r.status == TaskAddStatus::Success => JobTask::queued(id, correlation_id),
            Some(r) => {
                let error = r
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("task rejected ({:?})", r.status));
                warn!(task_id = %id, %error, "Task was not added");
                JobTask::failed(id, correlation_id, error)
            }
            None => JobTask::failed(id, correlation_id, "no result returned".to_string()),
        })
        .collect()
}

fn failed_task(task: &TaskInfo) -> FailedTask {
    let request_id = task
        .env(TASK_ARGUMENTS_ENV)
        .and_then(|body| serde_json::from_str::<RequestMessage>(body).ok())
        .map(|m| m.id);

    let mut description = match &task.failure {
        Some(f) => format!(
            "task {} terminated abnormally: {}/{}: {}",
            task.id, f.category, f.code, f.message
        ),
        None => format!("task {} terminated abnormally", task.id),
    };
    if let Some(code) = task.exit_code {
        description.push_str(&format!(" (exit code {})", code));
    }

    FailedTask {
        task_id: task.id.clone(),
        request_id,
        description,
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}
