//! In-memory implementation of BatchBackend
//!
//! Simulates a single pool: [`InMemoryBatchBackend::tick`] advances task
//! execution one step so tests and the local environment can watch work move
//! from active to running to completed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::backend::*;
use super::dispatcher::MAX_TASKS_PER_SUBMISSION;

/// Internal task state
struct StoredTask {
    spec: TaskSpec,
    state: TaskState,
    exit_code: Option<i32>,
    failure: Option<TaskFailureInfo>,
}

impl StoredTask {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.spec.id.clone(),
            state: self.state,
            environment: self.spec.environment.clone(),
            exit_code: self.exit_code,
            failure: self.failure.clone(),
        }
    }
}

/// Internal job state
struct StoredJob {
    info: JobInfo,
    on_all_tasks_complete: OnAllTasksComplete,
    tasks: Vec<StoredTask>,
}

impl StoredJob {
    fn counts(&self) -> JobTaskCounts {
        let mut counts = JobTaskCounts::default();
        for task in &self.tasks {
            match task.state {
                TaskState::Active => counts.active += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => {
                    counts.completed += 1;
                    if task.failure.is_some() {
                        counts.failed += 1;
                    } else {
                        counts.succeeded += 1;
                    }
                }
            }
        }
        counts
    }
}

/// In-memory implementation of BatchBackend
pub struct InMemoryBatchBackend {
    pool: RwLock<Option<PoolInfo>>,
    jobs: RwLock<BTreeMap<String, StoredJob>>,
    page_size: usize,
    rejected_prefix: Mutex<Option<String>>,
    submission_calls: AtomicUsize,
    chunk_sizes: Mutex<Vec<usize>>,
}

impl InMemoryBatchBackend {
    /// Create a backend with no pool
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(None),
            jobs: RwLock::new(BTreeMap::new()),
            page_size: 50,
            rejected_prefix: Mutex::new(None),
            submission_calls: AtomicUsize::new(0),
            chunk_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Set the pool
    pub fn with_pool(self, pool: PoolInfo) -> Self {
        self.set_pool(pool);
        self
    }

    /// Set the listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Replace the pool (e.g. to simulate scaling)
    pub fn set_pool(&self, pool: PoolInfo) {
        *self.pool.write() = Some(pool);
    }

    /// Insert a job directly in the given state
    pub fn insert_job(&self, job_id: &str, pool_id: &str, state: JobState) {
        self.jobs.write().insert(
            job_id.to_string(),
            StoredJob {
                info: JobInfo {
                    id: job_id.to_string(),
                    pool_id: pool_id.to_string(),
                    state,
                },
                on_all_tasks_complete: OnAllTasksComplete::NoAction,
                tasks: Vec::new(),
            },
        );
    }

    /// Get a job without going through the trait
    pub fn job(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.read().get(job_id).map(|j| j.info.clone())
    }

    /// Ids of all jobs
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    /// Ids of all tasks of a job, in submission order
    pub fn task_ids(&self, job_id: &str) -> Vec<String> {
        self.jobs
            .read()
            .get(job_id)
            .map(|j| j.tasks.iter().map(|t| t.spec.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Submitted task specs of a job
    pub fn task_specs(&self, job_id: &str) -> Vec<TaskSpec> {
        self.jobs
            .read()
            .get(job_id)
            .map(|j| j.tasks.iter().map(|t| t.spec.clone()).collect())
            .unwrap_or_default()
    }

    /// Reject tasks whose id starts with `prefix` as client errors
    pub fn reject_tasks_with_prefix(&self, prefix: impl Into<String>) {
        *self.rejected_prefix.lock() = Some(prefix.into());
    }

    /// Accept every task again
    pub fn clear_rejections(&self) {
        *self.rejected_prefix.lock() = None;
    }

    /// Number of `add_task_collection` calls made
    pub fn submission_calls(&self) -> usize {
        self.submission_calls.load(Ordering::Relaxed)
    }

    /// Size of every submitted chunk, sorted ascending
    pub fn chunk_sizes(&self) -> Vec<usize> {
        let mut sizes = self.chunk_sizes.lock().clone();
        sizes.sort_unstable();
        sizes
    }

    /// Complete a task with a failure
    ///
    /// Returns `false` if the task does not exist.
    pub fn fail_task(&self, job_id: &str, task_id: &str, message: &str) -> bool {
        let mut jobs = self.jobs.write();
        let Some(task) = jobs
            .get_mut(job_id)
            .and_then(|j| j.tasks.iter_mut().find(|t| t.spec.id == task_id))
        else {
            return false;
        };

        task.state = TaskState::Completed;
        task.exit_code = Some(1);
        task.failure = Some(TaskFailureInfo {
            category: "UserError".to_string(),
            code: "FailureExitCode".to_string(),
            message: message.to_string(),
        });
        true
    }

    /// Completion policy a job was created with
    pub fn on_all_tasks_complete(&self, job_id: &str) -> Option<OnAllTasksComplete> {
        self.jobs.read().get(job_id).map(|j| j.on_all_tasks_complete)
    }

    /// Advance the simulation one step
    ///
    /// Running tasks complete successfully, then active tasks start in
    /// submission order until the pool is full. Jobs never complete on their
    /// own; the completion policy is recorded but only `terminate_job` ends a
    /// job, so a local run can keep adding tasks between control cycles.
    pub fn tick(&self) {
        let capacity = self
            .pool
            .read()
            .as_ref()
            .map(|p| p.max_tasks_per_pool())
            .unwrap_or(0) as usize;

        let mut jobs = self.jobs.write();

        for job in jobs.values_mut() {
            for task in job.tasks.iter_mut().filter(|t| t.state == TaskState::Running) {
                task.state = TaskState::Completed;
                task.exit_code = Some(0);
            }
        }

        let mut free = capacity;
        for job in jobs
            .values_mut()
            .filter(|j| j.info.state == JobState::Active)
        {
            for task in job.tasks.iter_mut().filter(|t| t.state == TaskState::Active) {
                if free == 0 {
                    break;
                }
                task.state = TaskState::Running;
                free -= 1;
            }
        }
    }

    fn page<T: Clone>(&self, items: &[T], next_link: Option<&str>) -> (Vec<T>, Option<String>) {
        let start = next_link.and_then(|l| l.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(items.len());
        let page = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
        let next = (end < items.len()).then(|| end.to_string());
        (page, next)
    }
}

impl Default for InMemoryBatchBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn job_not_found(job_id: &str) -> BackendError {
    BackendError::NotFound {
        kind: "job",
        id: job_id.to_string(),
    }
}

#[async_trait]
impl BatchBackend for InMemoryBatchBackend {
    async fn get_job(&self, job_id: &str) -> Result<JobInfo, BackendError> {
        self.job(job_id).ok_or_else(|| job_not_found(job_id))
    }

    async fn create_job(&self, spec: JobSpec) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&spec.id) {
            return Err(BackendError::AlreadyExists {
                kind: "job",
                id: spec.id,
            });
        }

        jobs.insert(
            spec.id.clone(),
            StoredJob {
                info: JobInfo {
                    id: spec.id,
                    pool_id: spec.pool_id,
                    state: JobState::Active,
                },
                on_all_tasks_complete: spec.on_all_tasks_complete,
                tasks: Vec::new(),
            },
        );
        Ok(())
    }

    async fn terminate_job(&self, job_id: &str) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(job_id).ok_or_else(|| job_not_found(job_id))?;

        for task in job.tasks.iter_mut().filter(|t| t.state != TaskState::Completed) {
            task.state = TaskState::Completed;
            task.failure = Some(TaskFailureInfo {
                category: "UserError".to_string(),
                code: "TaskEnded".to_string(),
                message: "job was terminated".to_string(),
            });
        }
        job.info.state = JobState::Completed;
        Ok(())
    }

    async fn add_task_collection(
        &self,
        job_id: &str,
        tasks: Vec<TaskSpec>,
    ) -> Result<Vec<TaskAddResult>, BackendError> {
        self.submission_calls.fetch_add(1, Ordering::Relaxed);

        if tasks.len() > MAX_TASKS_PER_SUBMISSION {
            return Err(BackendError::RequestTooLarge {
                count: tasks.len(),
                max: MAX_TASKS_PER_SUBMISSION,
            });
        }
        self.chunk_sizes.lock().push(tasks.len());

        let rejected_prefix = self.rejected_prefix.lock().clone();
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(job_id).ok_or_else(|| job_not_found(job_id))?;
        if job.info.state != JobState::Active {
            return Err(BackendError::Transport(format!(
                "job {} is {} and does not accept tasks",
                job_id, job.info.state
            )));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for spec in tasks {
            let task_id = spec.id.clone();

            let rejection = if rejected_prefix
                .as_deref()
                .is_some_and(|p| task_id.starts_with(p))
            {
                Some(TaskAddError {
                    code: "InvalidPropertyValue".to_string(),
                    message: "The value provided for the task is invalid".to_string(),
                    values: vec![("TaskId".to_string(), task_id.clone())],
                })
            } else if job.tasks.iter().any(|t| t.spec.id == task_id) {
                Some(TaskAddError {
                    code: "TaskExists".to_string(),
                    message: "The specified task already exists".to_string(),
                    values: vec![],
                })
            } else {
                None
            };

            match rejection {
                Some(error) => results.push(TaskAddResult {
                    task_id,
                    status: TaskAddStatus::ClientError,
                    error: Some(error),
                }),
                None => {
                    job.tasks.push(StoredTask {
                        spec,
                        state: TaskState::Active,
                        exit_code: None,
                        failure: None,
                    });
                    results.push(TaskAddResult {
                        task_id,
                        status: TaskAddStatus::Success,
                        error: None,
                    });
                }
            }
        }

        Ok(results)
    }

    async fn get_pool(&self, pool_id: &str) -> Result<PoolInfo, BackendError> {
        self.pool
            .read()
            .clone()
            .filter(|p| p.id == pool_id)
            .ok_or_else(|| BackendError::NotFound {
                kind: "pool",
                id: pool_id.to_string(),
            })
    }

    async fn list_jobs(
        &self,
        pool_id: &str,
        next_link: Option<&str>,
    ) -> Result<JobPage, BackendError> {
        let jobs: Vec<JobInfo> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.info.pool_id == pool_id && j.info.state == JobState::Active)
            .map(|j| j.info.clone())
            .collect();

        let (jobs, next_link) = self.page(&jobs, next_link);
        Ok(JobPage { jobs, next_link })
    }

    async fn get_task_counts(&self, job_id: &str) -> Result<JobTaskCounts, BackendError> {
        self.jobs
            .read()
            .get(job_id)
            .map(StoredJob::counts)
            .ok_or_else(|| job_not_found(job_id))
    }

    async fn list_failed_tasks(
        &self,
        job_id: &str,
        next_link: Option<&str>,
    ) -> Result<TaskPage, BackendError> {
        let tasks: Vec<TaskInfo> = {
            let jobs = self.jobs.read();
            let job = jobs.get(job_id).ok_or_else(|| job_not_found(job_id))?;
            job.tasks
                .iter()
                .filter(|t| t.state == TaskState::Completed && t.failure.is_some())
                .map(StoredTask::info)
                .collect()
        };

        let (tasks, next_link) = self.page(&tasks, next_link);
        Ok(TaskPage { tasks, next_link })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pool(nodes: u32, slots: u32) -> PoolInfo {
        PoolInfo {
            id: "pool".to_string(),
            max_tasks_per_node: slots,
            current_dedicated_nodes: nodes,
            current_low_priority_nodes: 0,
        }
    }

    fn spec(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            command_line: "true".to_string(),
            resource_files: vec![],
            environment: vec![],
            max_wall_clock_time: Duration::from_secs(60),
            max_task_retry_count: 0,
        }
    }

    fn job_spec(id: &str, on_complete: OnAllTasksComplete) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            pool_id: "pool".to_string(),
            on_all_tasks_complete: on_complete,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let backend = InMemoryBatchBackend::new();
        backend
            .create_job(job_spec("j", OnAllTasksComplete::NoAction))
            .await
            .unwrap();

        let job = backend.get_job("j").await.unwrap();
        assert_eq!(job.state, JobState::Active);

        let again = backend
            .create_job(job_spec("j", OnAllTasksComplete::NoAction))
            .await;
        assert!(matches!(again, Err(BackendError::AlreadyExists { .. })));
        assert!(backend.get_job("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tick_respects_pool_capacity() {
        let backend = InMemoryBatchBackend::new().with_pool(pool(1, 2));
        backend.insert_job("j", "pool", JobState::Active);
        backend
            .add_task_collection("j", vec![spec("a"), spec("b"), spec("c")])
            .await
            .unwrap();

        backend.tick();
        let counts = backend.get_task_counts("j").await.unwrap();
        assert_eq!((counts.active, counts.running), (1, 2));

        backend.tick();
        let counts = backend.get_task_counts("j").await.unwrap();
        assert_eq!((counts.active, counts.running, counts.succeeded), (0, 1, 2));
    }

    #[tokio::test]
    async fn test_jobs_stay_active_between_batches() {
        let backend = InMemoryBatchBackend::new().with_pool(pool(1, 4));
        backend
            .create_job(job_spec("j", OnAllTasksComplete::TerminateJob))
            .await
            .unwrap();
        backend
            .add_task_collection("j", vec![spec("a")])
            .await
            .unwrap();

        backend.tick();
        backend.tick();
        assert_eq!(backend.job("j").unwrap().state, JobState::Active);

        backend.terminate_job("j").await.unwrap();
        assert_eq!(backend.job("j").unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_oversized_submission_is_rejected() {
        let backend = InMemoryBatchBackend::new();
        backend.insert_job("j", "pool", JobState::Active);

        let specs = (0..101).map(|i| spec(&format!("t{}", i))).collect();
        let result = backend.add_task_collection("j", specs).await;
        assert!(matches!(result, Err(BackendError::RequestTooLarge { .. })));
        assert!(backend.task_ids("j").is_empty());
    }

    #[tokio::test]
    async fn test_rejected_prefix_and_duplicates() {
        let backend = InMemoryBatchBackend::new();
        backend.insert_job("j", "pool", JobState::Active);
        backend.reject_tasks_with_prefix("bad");

        let results = backend
            .add_task_collection("j", vec![spec("ok"), spec("bad-1"), spec("ok")])
            .await
            .unwrap();

        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskAddStatus::Success,
                TaskAddStatus::ClientError,
                TaskAddStatus::ClientError
            ]
        );
        assert_eq!(backend.task_ids("j"), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_list_jobs_pages_active_jobs_of_pool() {
        let backend = InMemoryBatchBackend::new().with_page_size(2);
        for id in ["a", "b", "c"] {
            backend.insert_job(id, "pool", JobState::Active);
        }
        backend.insert_job("done", "pool", JobState::Completed);
        backend.insert_job("elsewhere", "other", JobState::Active);

        let first = backend.list_jobs("pool", None).await.unwrap();
        assert_eq!(first.jobs.len(), 2);
        let second = backend
            .list_jobs("pool", first.next_link.as_deref())
            .await
            .unwrap();
        assert_eq!(second.jobs.len(), 1);
        assert!(second.next_link.is_none());
    }

    #[tokio::test]
    async fn test_failed_tasks_are_listed() {
        let backend = InMemoryBatchBackend::new();
        backend.insert_job("j", "pool", JobState::Active);
        backend
            .add_task_collection("j", vec![spec("a"), spec("b")])
            .await
            .unwrap();

        assert!(backend.fail_task("j", "b", "scanner crashed"));
        assert!(!backend.fail_task("j", "missing", "x"));

        let page = backend.list_failed_tasks("j", None).await.unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.tasks[0].id, "b");
        assert_eq!(backend.get_task_counts("j").await.unwrap().failed, 1);
    }
}
