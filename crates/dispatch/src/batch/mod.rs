//! Execution backend and task dispatch
//!
//! This module provides:
//! - [`BatchBackend`] trait for the service that runs tasks on a compute pool
//! - [`TaskDispatcher`] for job lifecycle, chunked task submission and pool metrics
//! - [`InMemoryBatchBackend`], a single-pool simulation for testing and local runs

mod backend;
mod dispatcher;
mod memory;

pub use backend::{
    BackendError, BatchBackend, EnvironmentSetting, JobInfo, JobPage, JobSpec, JobState,
    JobTaskCounts, OnAllTasksComplete, PoolInfo, ResourceFile, TaskAddError, TaskAddResult,
    TaskAddStatus, TaskFailureInfo, TaskInfo, TaskPage, TaskSpec, TaskState,
};
pub use dispatcher::{
    DispatchError, DispatcherConfig, FailedTask, JobTask, JobTaskState, TaskDispatcher,
    JOB_ID_ENV, MAX_TASKS_PER_SUBMISSION, TASK_ARGUMENTS_ENV,
};
pub use memory::InMemoryBatchBackend;
