//! End-to-end tests of the dispatch worker against the in-memory collaborators
//!
//! Run with: cargo test -p scanfleet-dispatch --test worker_loop_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use scanfleet_dispatch::batch::{
    BatchBackend, DispatchError, InMemoryBatchBackend, JobState, PoolInfo, TaskDispatcher,
};
use scanfleet_dispatch::load::LoadConfig;
use scanfleet_dispatch::persistence::{
    InMemoryWorkItemStore, InMemoryWorkQueue, QueueConfig, QueueError, QueueMessage,
    RequestMessage, RequestPage, RunState, StoreError, WorkItemStore, WorkQueue, WorkRequest,
};
use scanfleet_dispatch::selection::SelectorConfig;
use scanfleet_dispatch::worker::{ExitReason, Worker, WorkerConfig, WorkerError};

const JOB_ID: &str = "scan-job";
const POOL_ID: &str = "scan-pool";

struct Harness {
    store: Arc<InMemoryWorkItemStore>,
    queue: Arc<InMemoryWorkQueue>,
    backend: Arc<InMemoryBatchBackend>,
}

impl Harness {
    /// Pool with a single node of four slots and an empty active job
    fn new() -> Self {
        let backend = InMemoryBatchBackend::new().with_pool(PoolInfo {
            id: POOL_ID.to_string(),
            max_tasks_per_node: 4,
            current_dedicated_nodes: 1,
            current_low_priority_nodes: 0,
        });
        backend.insert_job(JOB_ID, POOL_ID, JobState::Active);

        Self {
            store: Arc::new(InMemoryWorkItemStore::new()),
            queue: Arc::new(InMemoryWorkQueue::new(QueueConfig::default())),
            backend: Arc::new(backend),
        }
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig::new(JOB_ID, POOL_ID)
            .with_uniquify_job_id(false)
            .with_run_once(true)
    }

    fn worker(&self, config: WorkerConfig) -> Worker {
        self.worker_with(config, self.store.clone(), self.queue.clone())
    }

    fn worker_with(
        &self,
        config: WorkerConfig,
        store: Arc<dyn WorkItemStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Worker {
        let dispatcher = TaskDispatcher::new(self.backend.clone(), config.dispatcher.clone());
        Worker::new(config, store, queue, dispatcher)
    }

    async fn add_request(&self, request: WorkRequest) -> String {
        let body = RequestMessage::new(&request.id).to_body();
        self.store.insert(request).await.unwrap();
        self.queue.enqueue(body).await.unwrap()
    }

    /// Fill the pool: four running tasks and four waiting
    async fn fill_pool(&self) {
        let dispatcher = TaskDispatcher::new(
            self.backend.clone(),
            scanfleet_dispatch::batch::DispatcherConfig::new(POOL_ID),
        );
        let filler = InMemoryWorkQueue::default();
        for i in 0..8 {
            filler
                .enqueue(RequestMessage::new(format!("filler-{}", i)).to_body())
                .await
                .unwrap();
        }
        let messages = filler.receive(8).await.unwrap();
        dispatcher.create_tasks(JOB_ID, &messages).await;
        self.backend.tick();
    }
}

/// Queue whose first `failures` receives fail
struct FlakyQueue {
    inner: Arc<InMemoryWorkQueue>,
    failures: AtomicUsize,
}

impl FlakyQueue {
    fn new(inner: Arc<InMemoryWorkQueue>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn enqueue(&self, body: String) -> Result<String, QueueError> {
        self.inner.enqueue(body).await
    }

    async fn receive(&self, max_count: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Backend("throttled".to_string()));
        }
        self.inner.receive(max_count).await
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.inner.delete(message).await
    }

    async fn move_to_dead_letter(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.inner.move_to_dead_letter(message).await
    }
}

/// Store whose first `failures` batch reads fail
struct FlakyStore {
    inner: Arc<InMemoryWorkItemStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl WorkItemStore for FlakyStore {
    async fn read_many(&self, ids: &[String]) -> Result<Vec<WorkRequest>, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.read_many(ids).await
    }

    async fn read_page(
        &self,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<RequestPage, StoreError> {
        self.inner.read_page(continuation, page_size).await
    }

    async fn insert(&self, record: WorkRequest) -> Result<WorkRequest, StoreError> {
        self.inner.insert(record).await
    }

    async fn update(&self, record: WorkRequest) -> Result<WorkRequest, StoreError> {
        self.inner.update(record).await
    }

    async fn delete_many(&self, ids: &[String]) -> Result<(), StoreError> {
        self.inner.delete_many(ids).await
    }
}

fn assert_send<T: Send>(_: &T) {}

#[test]
fn test_worker_run_future_is_send() {
    let harness = Harness::new();
    let mut worker = harness.worker(harness.config());
    let run = worker.run();
    assert_send(&run);
}

#[test_log::test(tokio::test)]
async fn test_queue_error_abandons_only_the_cycle() {
    let harness = Harness::new();
    harness.add_request(WorkRequest::pending("req-1", "a")).await;
    let queue = Arc::new(FlakyQueue::new(harness.queue.clone(), 1));

    let mut worker = harness.worker_with(harness.config(), harness.store.clone(), queue.clone());
    let report = worker.run().await.unwrap();

    assert_eq!(report.exit_reason, ExitReason::RunOnce);
    assert_eq!(report.tasks_admitted, 0);
    assert_eq!(worker.load_state().unwrap().last_admitted_count, 0);
    assert_eq!(harness.backend.submission_calls(), 0);
    assert_eq!(harness.queue.len(), 1);

    // The next cycle picks the message up
    let report = harness
        .worker_with(harness.config(), harness.store.clone(), queue)
        .run()
        .await
        .unwrap();
    assert_eq!(report.tasks_admitted, 1);
    assert!(harness.queue.is_empty());
    assert_eq!(harness.store.get("req-1").unwrap().run_state, RunState::Running);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_store_error_leaves_messages_for_redelivery() {
    let harness = Harness::new();
    harness.add_request(WorkRequest::pending("req-1", "a")).await;
    let store = Arc::new(FlakyStore {
        inner: harness.store.clone(),
        failures: AtomicUsize::new(1),
    });

    let report = harness
        .worker_with(harness.config(), store.clone(), harness.queue.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.tasks_admitted, 0);
    assert_eq!(harness.queue.len(), 1);

    // Still leased
    let report = harness
        .worker_with(harness.config(), store.clone(), harness.queue.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.tasks_admitted, 0);

    tokio::time::advance(QueueConfig::default().visibility_timeout + Duration::from_secs(1)).await;

    let report = harness
        .worker_with(harness.config(), store, harness.queue.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.tasks_admitted, 1);
    assert!(harness.queue.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_rejected_message_is_admitted_after_visibility_timeout() {
    let harness = Harness::new();
    let rejected_message = harness.add_request(WorkRequest::pending("req-1", "a")).await;
    harness.add_request(WorkRequest::pending("req-2", "b")).await;
    harness.backend.reject_tasks_with_prefix(rejected_message);

    let report = harness.worker(harness.config()).run().await.unwrap();
    assert_eq!(report.tasks_admitted, 1);
    harness.backend.clear_rejections();

    // The rejected message is still leased
    let report = harness.worker(harness.config()).run().await.unwrap();
    assert_eq!(report.tasks_admitted, 0);
    assert_eq!(harness.queue.len(), 1);

    tokio::time::advance(QueueConfig::default().visibility_timeout + Duration::from_secs(1)).await;

    let report = harness.worker(harness.config()).run().await.unwrap();
    assert_eq!(report.tasks_admitted, 1);
    assert!(harness.queue.is_empty());
    assert_eq!(harness.store.get("req-1").unwrap().run_state, RunState::Running);
    assert_eq!(harness.backend.task_ids(JOB_ID).len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_full_pool_admits_nothing() {
    let harness = Harness::new();
    harness.fill_pool().await;
    harness.add_request(WorkRequest::pending("req-1", "site-1")).await;
    let submissions_before = harness.backend.submission_calls();

    let mut worker = harness.worker(harness.config().with_load(LoadConfig::new(1.0)));
    let report = worker.run().await.unwrap();

    assert_eq!(report.exit_reason, ExitReason::RunOnce);
    assert_eq!(report.tasks_admitted, 0);
    assert_eq!(harness.queue.receive_calls(), 0);
    assert_eq!(harness.backend.submission_calls(), submissions_before);
    assert_eq!(worker.load_state().unwrap().last_admitted_count, 0);
}

#[test_log::test(tokio::test)]
async fn test_queued_tasks_delete_their_messages() {
    let harness = Harness::new();
    harness.add_request(WorkRequest::pending("req-1", "site-1")).await;
    harness.add_request(WorkRequest::pending("req-2", "site-2")).await;

    let mut worker = harness.worker(harness.config());
    let report = worker.run().await.unwrap();

    assert_eq!(report.tasks_admitted, 2);
    assert_eq!(report.messages_deleted, 2);
    assert_eq!(harness.queue.deleted_count(), 2);
    assert!(harness.queue.is_empty());
    assert_eq!(worker.load_state().unwrap().last_admitted_count, 2);
    assert_eq!(harness.backend.task_ids(JOB_ID).len(), 2);

    for id in ["req-1", "req-2"] {
        let record = harness.store.get(id).unwrap();
        assert_eq!(record.run_state, RunState::Running);
        assert_eq!(record.retry_count, 0);
    }
}

#[test_log::test(tokio::test)]
async fn test_messages_are_screened_by_request_state() {
    let harness = Harness::new();
    harness
        .add_request(WorkRequest::pending("done", "a").with_run_state(RunState::Completed))
        .await;
    harness
        .add_request(WorkRequest::pending("exhausted", "b").with_retry_count(3))
        .await;
    harness
        .add_request(
            WorkRequest::pending("busy", "c")
                .with_run_state(RunState::Running)
                .with_last_updated_at(Utc::now()),
        )
        .await;
    harness
        .queue
        .enqueue(RequestMessage::new("missing").to_body())
        .await
        .unwrap();
    harness.queue.enqueue("not json".to_string()).await.unwrap();

    let mut worker = harness.worker(harness.config());
    let report = worker.run().await.unwrap();

    assert_eq!(report.tasks_admitted, 0);
    assert_eq!(report.messages_deleted, 2);
    assert_eq!(report.messages_dead_lettered, 2);
    assert_eq!(report.messages_skipped, 1);
    assert_eq!(harness.backend.submission_calls(), 0);

    assert_eq!(harness.queue.dead_letters().len(), 2);
    // The skipped message stays leased until its visibility timeout
    assert_eq!(harness.queue.len(), 1);

    let exhausted = harness.store.get("exhausted").unwrap();
    assert_eq!(exhausted.run_state, RunState::Failed);
    assert!(exhausted.error.is_some());
    assert_eq!(harness.store.get("busy").unwrap().run_state, RunState::Running);
}

#[test_log::test(tokio::test)]
async fn test_stale_request_is_retried() {
    let harness = Harness::new();
    harness
        .add_request(
            WorkRequest::pending("stale", "a")
                .with_run_state(RunState::Failed)
                .with_retry_count(1)
                .with_last_updated_at(Utc::now() - chrono::Duration::hours(1)),
        )
        .await;

    let config = harness
        .config()
        .with_selector(SelectorConfig::default().with_retry_interval(Duration::from_secs(900)));
    let report = harness.worker(config).run().await.unwrap();

    assert_eq!(report.tasks_admitted, 1);
    let record = harness.store.get("stale").unwrap();
    assert_eq!(record.run_state, RunState::Running);
    assert_eq!(record.retry_count, 2);
}

#[test_log::test(tokio::test)]
async fn test_rejected_task_keeps_its_message() {
    let harness = Harness::new();
    let rejected_message = harness.add_request(WorkRequest::pending("req-1", "a")).await;
    harness.add_request(WorkRequest::pending("req-2", "b")).await;
    harness.backend.reject_tasks_with_prefix(rejected_message);

    let report = harness.worker(harness.config()).run().await.unwrap();

    assert_eq!(report.tasks_admitted, 1);
    assert_eq!(harness.queue.deleted_count(), 1);
    assert_eq!(harness.queue.len(), 1);
    assert_eq!(harness.store.get("req-1").unwrap().run_state, RunState::Pending);
    assert_eq!(harness.store.get("req-2").unwrap().run_state, RunState::Running);
}

#[test_log::test(tokio::test)]
async fn test_failed_tasks_are_reconciled_on_exit() {
    let harness = Harness::new();
    harness
        .store
        .insert(WorkRequest::pending("req-1", "a").with_run_state(RunState::Running))
        .await
        .unwrap();
    harness
        .store
        .insert(WorkRequest::pending("req-2", "b").with_run_state(RunState::Failed))
        .await
        .unwrap();

    // Tasks from an earlier run: two fail, one of them for a request that is gone
    let dispatcher = TaskDispatcher::new(
        harness.backend.clone(),
        scanfleet_dispatch::batch::DispatcherConfig::new(POOL_ID),
    );
    let earlier = InMemoryWorkQueue::default();
    for id in ["req-1", "req-2", "gone"] {
        earlier.enqueue(RequestMessage::new(id).to_body()).await.unwrap();
    }
    let tasks = dispatcher
        .create_tasks(JOB_ID, &earlier.receive(3).await.unwrap())
        .await;
    for task in &tasks {
        harness.backend.fail_task(JOB_ID, &task.id, "scanner crashed");
    }

    let config = harness.config().with_run_once(false);
    let report = harness.worker(config).run().await.unwrap();

    assert_eq!(report.exit_reason, ExitReason::QueueDrained);
    assert_eq!(report.requests_reconciled, 1);

    let record = harness.store.get("req-1").unwrap();
    assert_eq!(record.run_state, RunState::Failed);
    assert!(record.error.unwrap().contains("scanner crashed"));
    // Already failed records are left alone
    assert_eq!(harness.store.get("req-2").unwrap().version, 1);
}

#[test_log::test(tokio::test)]
async fn test_inactive_job_is_fatal() {
    let harness = Harness::new();
    harness.backend.insert_job(JOB_ID, POOL_ID, JobState::Completed);

    let result = harness.worker(harness.config()).run().await;

    assert!(matches!(
        result,
        Err(WorkerError::Dispatch(DispatchError::JobNotActive { .. }))
    ));
}

#[test_log::test(tokio::test)]
async fn test_second_run_is_rejected() {
    let harness = Harness::new();
    let mut worker = harness.worker(harness.config());

    worker.run().await.unwrap();
    assert!(matches!(worker.run().await, Err(WorkerError::AlreadyRun)));
}

#[test_log::test(tokio::test)]
async fn test_new_job_is_created_and_terminated_on_exit() {
    let harness = Harness::new();
    harness.add_request(WorkRequest::pending("req-1", "a")).await;

    let config = harness
        .config()
        .with_job_id("nightly")
        .with_uniquify_job_id(true)
        .with_terminate_job_on_exit(true);
    let report = harness.worker(config).run().await.unwrap();

    assert!(report.job_id.starts_with("nightly-"));
    let job = harness.backend.get_job(&report.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    // The queued task was cut short by termination and written back
    assert_eq!(report.requests_reconciled, 1);
    assert_eq!(harness.store.get("req-1").unwrap().run_state, RunState::Failed);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_interrupts_interval_wait() {
    let harness = Harness::new();
    harness.fill_pool().await;

    let config = harness
        .config()
        .with_run_once(false)
        .with_load(LoadConfig::new(1.0))
        .with_add_tasks_interval(Duration::from_secs(3600));
    let mut worker = harness.worker(config);
    let shutdown = worker.shutdown_handle();

    let run = tokio::spawn(async move { worker.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.shutdown();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(report.exit_reason, ExitReason::Shutdown);
    assert_eq!(report.cycles, 1);
    assert!(shutdown.is_shutdown());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_restart_window_waits_for_pool_to_drain() {
    let harness = Harness::new();
    harness.fill_pool().await;

    let backend = harness.backend.clone();
    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            backend.tick();
        }
    });

    let config = harness
        .config()
        .with_run_once(false)
        .with_load(LoadConfig::new(1.0))
        .with_max_wall_clock(Duration::from_secs(1))
        .with_add_tasks_interval(Duration::from_secs(15))
        .with_drain_poll_interval(Duration::from_secs(5));
    let report = harness.worker(config).run().await.unwrap();
    ticker.abort();

    assert_eq!(report.exit_reason, ExitReason::RestartWindowElapsed);
    assert_eq!(report.cycles, 1);

    let counts = harness.backend.get_task_counts(JOB_ID).await.unwrap();
    assert!(counts.active + counts.running <= 1);
}
