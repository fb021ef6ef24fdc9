//! Dispatch control loop
//!
//! One worker drives one job on one pool: every cycle it samples the pool,
//! asks the load generator for an admission budget, drains that many queue
//! messages into tasks and feeds the real admitted count back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::config::{ConfigError, WorkerConfig};
use crate::batch::{DispatchError, JobTask, TaskDispatcher};
use crate::load::{PoolLoadGenerator, PoolLoadState, PoolMetrics};
use crate::persistence::{
    QueueError, QueueMessage, RunState, StoreError, WorkItemStore, WorkQueue, WorkRequest,
};
use crate::reliability::update_with_retry;
use crate::selection::{Condition, Disposition, RequestSelector};

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// `run` was called on a worker that already ran
    #[error("worker has already run")]
    AlreadyRun,
}

/// Control loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Resolving the job
    Initializing,
    /// Reading pool metrics and computing the admission budget
    Sampling,
    /// Deciding whether this cycle admits anything
    Admitting,
    /// Moving queue messages into tasks
    Draining,
    /// Restart window elapsed; waiting for the pool to empty
    WaitingForDrain,
    /// Reconciling failed tasks
    Terminating,
    Stopped,
}

/// Why the control loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Nothing left to admit and the pool is idle
    QueueDrained,
    /// Wall-clock limit reached and the pool drained
    RestartWindowElapsed,
    /// Shutdown was requested
    Shutdown,
    /// Single-cycle mode
    RunOnce,
}

/// Summary of a worker run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub job_id: String,
    pub cycles: u64,
    pub tasks_admitted: u64,
    pub messages_deleted: u64,
    pub messages_dead_lettered: u64,
    pub messages_skipped: u64,
    /// Work requests marked failed from failed tasks
    pub requests_reconciled: u64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: u64,
    tasks_admitted: u64,
    messages_deleted: u64,
    messages_dead_lettered: u64,
    messages_skipped: u64,
    requests_reconciled: u64,
}

/// Requests a running worker to stop
///
/// Every wait in the control loop races the signal; the worker still
/// reconciles failed tasks before returning.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal shutdown
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Check whether shutdown was signalled
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

enum CycleOutcome {
    Continue,
    Idle,
}

#[derive(Debug, Default)]
struct DrainOutcome {
    received: usize,
    admitted: u32,
}

#[derive(Debug, Default)]
struct Screened {
    dispatch: Vec<(QueueMessage, Condition)>,
    delete: Vec<QueueMessage>,
    dead_letter: Vec<QueueMessage>,
    skipped: usize,
}

#[derive(Clone, Copy)]
enum QueueOp {
    Delete,
    DeadLetter,
}

/// Pool dispatch worker
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn WorkItemStore>,
    queue: Arc<dyn WorkQueue>,
    dispatcher: TaskDispatcher,
    selector: RequestSelector,
    load: PoolLoadGenerator,
    state: WorkerState,
    counters: Counters,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    /// Create a new worker
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn WorkItemStore>,
        queue: Arc<dyn WorkQueue>,
        dispatcher: TaskDispatcher,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let selector = RequestSelector::new(Arc::clone(&store), config.selector.clone());
        let load = PoolLoadGenerator::new(config.load.clone());

        Self {
            config,
            store,
            queue,
            dispatcher,
            selector,
            load,
            state: WorkerState::Initializing,
            counters: Counters::default(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Handle for stopping the worker from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Load generator state, `None` before the first cycle
    pub fn load_state(&self) -> Option<&PoolLoadState> {
        self.load.state()
    }

    /// Worker configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the control loop to completion
    ///
    /// Errors while resolving the job or sampling the pool end the run;
    /// errors while reconciling are logged.
    pub async fn run(&mut self) -> Result<WorkerReport, WorkerError> {
        if self.state != WorkerState::Initializing {
            return Err(WorkerError::AlreadyRun);
        }

        self.config.validate()?;
        let job_id = self
            .dispatcher
            .create_job_if_not_exists(&self.config.job_id, self.config.uniquify_job_id)
            .await?;
        let restart_after = Instant::now() + self.config.max_wall_clock;

        info!(
            %job_id,
            pool_id = %self.dispatcher.config().pool_id,
            add_tasks_interval_secs = self.config.add_tasks_interval.as_secs(),
            max_wall_clock_secs = self.config.max_wall_clock.as_secs(),
            run_once = self.config.run_once,
            "Worker started"
        );

        let exit_reason = loop {
            if self.is_shutdown() {
                break ExitReason::Shutdown;
            }

            if Instant::now() >= restart_after {
                break if self.wait_for_drain(&job_id).await? {
                    ExitReason::RestartWindowElapsed
                } else {
                    ExitReason::Shutdown
                };
            }

            self.counters.cycles += 1;
            if let CycleOutcome::Idle = self.run_cycle(&job_id).await? {
                info!(%job_id, "Queue drained and pool idle");
                break ExitReason::QueueDrained;
            }

            if self.config.run_once {
                break ExitReason::RunOnce;
            }

            if self.sleep(self.config.add_tasks_interval).await {
                break ExitReason::Shutdown;
            }
        };

        self.terminate(&job_id).await;
        self.state = WorkerState::Stopped;

        let report = WorkerReport {
            job_id,
            cycles: self.counters.cycles,
            tasks_admitted: self.counters.tasks_admitted,
            messages_deleted: self.counters.messages_deleted,
            messages_dead_lettered: self.counters.messages_dead_lettered,
            messages_skipped: self.counters.messages_skipped,
            requests_reconciled: self.counters.requests_reconciled,
            exit_reason,
        };
        info!(?report, "Worker stopped");
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn run_cycle(&mut self, job_id: &str) -> Result<CycleOutcome, WorkerError> {
        self.state = WorkerState::Sampling;
        let metrics = self.dispatcher.get_pool_metrics().await?;
        let snapshot = self.load.get_load_snapshot(&metrics);

        info!(
            pool_id = %metrics.pool_id,
            max_tasks_per_pool = metrics.max_tasks_per_pool,
            active_tasks = metrics.active_tasks,
            running_tasks = metrics.running_tasks,
            tasks_to_admit = snapshot.tasks_to_admit,
            active_to_running_ratio = snapshot.target_active_to_running_ratio,
            processing_speed_per_minute = snapshot.processing_speed_per_minute,
            "Sampled pool load"
        );

        self.state = WorkerState::Admitting;
        if snapshot.tasks_to_admit == 0 {
            self.load.set_last_admitted_count(0);
            return Ok(if metrics.is_idle() {
                CycleOutcome::Idle
            } else {
                CycleOutcome::Continue
            });
        }

        self.state = WorkerState::Draining;
        let drained = match self.drain_queue(job_id, snapshot.tasks_to_admit).await {
            Ok(drained) => drained,
            Err(e @ (WorkerError::Queue(_) | WorkerError::Store(_))) => {
                // Leased messages become visible again after their timeout
                error!(error = %e, "Draining failed, abandoning cycle");
                self.load.set_last_admitted_count(0);
                return Ok(CycleOutcome::Continue);
            }
            Err(e) => return Err(e),
        };
        self.load.set_last_admitted_count(drained.admitted);
        self.counters.tasks_admitted += u64::from(drained.admitted);

        info!(tasks_admitted = drained.admitted, "Admitted tasks");

        if drained.received == 0 && metrics.is_idle() {
            return Ok(CycleOutcome::Idle);
        }
        Ok(CycleOutcome::Continue)
    }

    /// Receive up to `budget` messages and turn the eligible ones into tasks
    async fn drain_queue(&mut self, job_id: &str, budget: u32) -> Result<DrainOutcome, WorkerError> {
        let messages = self.queue.receive(budget as usize).await?;
        if messages.is_empty() {
            debug!("Queue is empty");
            return Ok(DrainOutcome::default());
        }
        let received = messages.len();

        let screened = self.screen(messages).await?;
        let skipped = screened.skipped;
        let deleted = self.apply_queue_op(QueueOp::Delete, screened.delete).await;
        let dead_lettered = self
            .apply_queue_op(QueueOp::DeadLetter, screened.dead_letter)
            .await;

        let (messages, conditions): (Vec<QueueMessage>, Vec<Condition>) =
            screened.dispatch.into_iter().unzip();
        let tasks = if messages.is_empty() {
            Vec::new()
        } else {
            self.dispatcher.create_tasks(job_id, &messages).await
        };

        let mut queued_messages = Vec::new();
        let mut queued_requests = Vec::new();
        for task in tasks.iter().filter(|t| t.is_queued()) {
            if let Some(index) = messages.iter().position(|m| m.id == task.correlation_id) {
                queued_messages.push(messages[index].clone());
                if let Ok(request) = messages[index].request() {
                    queued_requests.push((request.id, conditions[index]));
                }
            }
        }
        log_failed_submissions(&tasks);

        let admitted = queued_messages.len() as u32;
        let deleted_after_dispatch = self.apply_queue_op(QueueOp::Delete, queued_messages).await;
        self.mark_running(queued_requests).await;

        let deleted = deleted + deleted_after_dispatch;
        self.counters.messages_deleted += deleted as u64;
        self.counters.messages_dead_lettered += dead_lettered as u64;
        self.counters.messages_skipped += skipped as u64;

        info!(
            received,
            accepted = messages.len(),
            deleted,
            dead_lettered,
            skipped,
            "Drained queue"
        );

        Ok(DrainOutcome { received, admitted })
    }

    /// Route each message by the state of its work request
    async fn screen(&self, messages: Vec<QueueMessage>) -> Result<Screened, WorkerError> {
        let mut screened = Screened::default();
        let mut parsed = Vec::with_capacity(messages.len());

        for message in messages {
            match message.request() {
                Ok(request) => parsed.push((message, request.id)),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Unreadable message body");
                    screened.dead_letter.push(message);
                }
            }
        }

        let ids: Vec<String> = parsed.iter().map(|(_, id)| id.clone()).collect();
        let records: HashMap<String, WorkRequest> = if ids.is_empty() {
            HashMap::new()
        } else {
            self.store
                .read_many(&ids)
                .await?
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect()
        };

        let now = Utc::now();
        for (message, request_id) in parsed {
            let Some(record) = records.get(&request_id) else {
                warn!(message_id = %message.id, %request_id, "No work request for message");
                screened.delete.push(message);
                continue;
            };

            match self.selector.classify(record, now) {
                Disposition::Process(condition) => screened.dispatch.push((message, condition)),
                Disposition::Delete(Condition::NoRetry) => {
                    self.mark_exhausted(&request_id).await;
                    screened.dead_letter.push(message);
                }
                Disposition::Delete(_) => {
                    debug!(%request_id, "Work request already completed");
                    screened.delete.push(message);
                }
                Disposition::Skip => screened.skipped += 1,
            }
        }

        Ok(screened)
    }

    async fn mark_exhausted(&self, request_id: &str) {
        let max_retry_count = self.config.selector.max_retry_count;
        let result = update_with_retry(
            self.store.as_ref(),
            request_id,
            &self.config.conflict_retry,
            |record| {
                if record.run_state == RunState::Failed {
                    return false;
                }
                record.run_state = RunState::Failed;
                record.error = Some(format!(
                    "retry limit of {} reached after {} attempts",
                    max_retry_count, record.retry_count
                ));
                record.last_updated_at = Utc::now();
                true
            },
        )
        .await;

        if let Err(e) = result {
            error!(%request_id, error = %e, "Failed to mark work request failed");
        }
    }

    async fn mark_running(&self, requests: Vec<(String, Condition)>) {
        let store = Arc::clone(&self.store);
        let policy = self.config.conflict_retry.clone();

        stream::iter(requests)
            .map(move |(request_id, condition)| {
                let store = Arc::clone(&store);
                let policy = policy.clone();
                async move {
                    let mark = move |record: &mut WorkRequest| {
                        record.run_state = RunState::Running;
                        record.last_updated_at = Utc::now();
                        if condition == Condition::Retry {
                            record.retry_count += 1;
                        }
                        true
                    };
                    let result = update_with_retry(store.as_ref(), &request_id, &policy, mark).await;

                    match result {
                        Ok(Some(_)) => {}
                        Ok(None) => warn!(%request_id, "Work request disappeared after dispatch"),
                        Err(e) => {
                            error!(%request_id, error = %e, "Failed to mark work request running")
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_parallel_queue_ops)
            .collect::<Vec<()>>()
            .await;
    }

    /// Apply a queue operation to every message; returns how many succeeded
    async fn apply_queue_op(&self, op: QueueOp, messages: Vec<QueueMessage>) -> usize {
        let queue = Arc::clone(&self.queue);

        stream::iter(messages)
            .map(move |message| {
                let queue = Arc::clone(&queue);
                async move {
                    let result = match op {
                        QueueOp::Delete => queue.delete(&message).await,
                        QueueOp::DeadLetter => queue.move_to_dead_letter(&message).await,
                    };
                    if let Err(e) = &result {
                        error!(message_id = %message.id, error = %e, "Queue operation failed");
                    }
                    result.is_ok()
                }
            })
            .buffer_unordered(self.config.max_parallel_queue_ops)
            .fold(0, |succeeded, ok| async move { succeeded + usize::from(ok) })
            .await
    }

    /// Poll the pool until it is nearly empty; `false` if interrupted
    #[instrument(skip(self))]
    async fn wait_for_drain(&mut self, job_id: &str) -> Result<bool, WorkerError> {
        self.state = WorkerState::WaitingForDrain;
        info!(
            idle_threshold = self.config.drain_idle_threshold,
            "Restart window elapsed, waiting for pool to drain"
        );

        loop {
            let metrics: PoolMetrics = self.dispatcher.get_pool_metrics().await?;
            if metrics.total_tasks() <= self.config.drain_idle_threshold {
                info!(
                    active_tasks = metrics.active_tasks,
                    running_tasks = metrics.running_tasks,
                    "Pool drained"
                );
                return Ok(true);
            }

            debug!(
                active_tasks = metrics.active_tasks,
                running_tasks = metrics.running_tasks,
                "Pool still busy"
            );
            if self.sleep(self.config.drain_poll_interval).await {
                return Ok(false);
            }
        }
    }

    #[instrument(skip(self))]
    async fn terminate(&mut self, job_id: &str) {
        self.state = WorkerState::Terminating;

        if self.config.terminate_job_on_exit {
            if let Err(e) = self.dispatcher.terminate_job(job_id).await {
                error!(%job_id, error = %e, "Failed to terminate job");
            }
        }

        match self.reconcile_failed_tasks(job_id).await {
            Ok(count) => self.counters.requests_reconciled += count,
            Err(e) => error!(%job_id, error = %e, "Failed to reconcile failed tasks"),
        }
    }

    /// Write backend task failures back to their work requests
    async fn reconcile_failed_tasks(&self, job_id: &str) -> Result<u64, WorkerError> {
        let failed = self.dispatcher.get_failed_tasks(job_id).await?;
        let mut reconciled = 0;

        for task in &failed {
            let Some(request_id) = task.request_id.as_deref() else {
                warn!(task_id = %task.task_id, "Failed task carries no work request id");
                continue;
            };

            let mut written = false;
            let record = update_with_retry(
                self.store.as_ref(),
                request_id,
                &self.config.conflict_retry,
                |record| {
                    written = !matches!(record.run_state, RunState::Failed | RunState::Completed);
                    if written {
                        record.run_state = RunState::Failed;
                        record.error = Some(task.description.clone());
                        record.last_updated_at = Utc::now();
                    }
                    written
                },
            )
            .await?;

            match record {
                None => warn!(
                    task_id = %task.task_id,
                    %request_id,
                    "Failed task has no matching work request"
                ),
                Some(_) if written => {
                    reconciled += 1;
                    info!(task_id = %task.task_id, %request_id, "Marked work request failed");
                }
                Some(_) => {}
            }
        }

        if !failed.is_empty() {
            info!(failed_tasks = failed.len(), reconciled, "Reconciled failed tasks");
        }
        Ok(reconciled)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep unless shutdown is signalled first; returns `true` on shutdown
    async fn sleep(&self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow_and_update() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown requested");
                true
            }
        }
    }
}

fn log_failed_submissions(tasks: &[JobTask]) {
    for task in tasks.iter().filter(|t| !t.is_queued()) {
        warn!(
            task_id = %task.id,
            message_id = %task.correlation_id,
            error = task.error.as_deref().unwrap_or("unknown"),
            "Task submission failed, message kept for retry"
        );
    }
}
