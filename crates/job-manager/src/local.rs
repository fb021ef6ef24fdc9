//! Local environment
//!
//! In-memory work item store, queue and a simulated pool wired together so the
//! worker runs end to end on one machine. A background simulator advances the
//! pool on a fixed tick.

use std::sync::Arc;
use std::time::Duration;

use scanfleet_dispatch::batch::{InMemoryBatchBackend, PoolInfo, TaskDispatcher};
use scanfleet_dispatch::persistence::{
    InMemoryWorkItemStore, InMemoryWorkQueue, QueueError, RequestMessage, StoreError,
    WorkItemStore, WorkQueue, WorkRequest,
};
use scanfleet_dispatch::selection::RequestSelector;
use scanfleet_dispatch::worker::{ConfigError, Worker, WorkerConfig};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Shape of the simulated pool and the initial workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Pending requests created at startup
    pub seed_requests: usize,
    pub pool_nodes: u32,
    pub task_slots_per_node: u32,
    /// How often the simulated pool advances
    pub tick_interval: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            seed_requests: 0,
            pool_nodes: 2,
            task_slots_per_node: 4,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl LocalConfig {
    /// Load from environment variables
    ///
    /// - `SEED_REQUESTS` (default 0)
    /// - `LOCAL_POOL_NODES` (default 2)
    /// - `LOCAL_TASK_SLOTS_PER_NODE` (default 4)
    /// - `LOCAL_TICK_INTERVAL_MILLIS` (default 1000, must be positive)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let tick_millis: Option<u64> = parse(&lookup, "LOCAL_TICK_INTERVAL_MILLIS")?;
        if tick_millis == Some(0) {
            return Err(ConfigError::Invalid {
                name: "LOCAL_TICK_INTERVAL_MILLIS",
                value: "0".to_string(),
                reason: "tick interval must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            seed_requests: parse(&lookup, "SEED_REQUESTS")?.unwrap_or(defaults.seed_requests),
            pool_nodes: parse(&lookup, "LOCAL_POOL_NODES")?.unwrap_or(defaults.pool_nodes),
            task_slots_per_node: parse(&lookup, "LOCAL_TASK_SLOTS_PER_NODE")?
                .unwrap_or(defaults.task_slots_per_node),
            tick_interval: tick_millis
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
        })
    }
}

fn parse<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name).map(|v| v.trim().to_string()) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
    }
}

/// Errors while seeding the local workload
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// In-memory collaborators for one worker
pub struct LocalEnvironment {
    pub store: Arc<InMemoryWorkItemStore>,
    pub queue: Arc<InMemoryWorkQueue>,
    pub backend: Arc<InMemoryBatchBackend>,
    selector: RequestSelector,
    tick_interval: Duration,
}

impl LocalEnvironment {
    /// Build collaborators matching the worker configuration
    pub fn new(worker: &WorkerConfig, local: &LocalConfig) -> Self {
        let backend = InMemoryBatchBackend::new().with_pool(PoolInfo {
            id: worker.dispatcher.pool_id.clone(),
            max_tasks_per_node: local.task_slots_per_node,
            current_dedicated_nodes: local.pool_nodes,
            current_low_priority_nodes: 0,
        });

        let store = Arc::new(InMemoryWorkItemStore::new());
        let selector = RequestSelector::new(store.clone(), worker.selector.clone());

        Self {
            store,
            queue: Arc::new(InMemoryWorkQueue::new(worker.queue.clone())),
            backend: Arc::new(backend),
            selector,
            tick_interval: local.tick_interval,
        }
    }

    /// Create `count` pending requests and queue a dispatch message for each
    pub async fn seed(&self, count: usize) -> Result<(), SeedError> {
        for i in 0..count {
            let request = WorkRequest::pending(format!("request-{:05}", i), format!("site-{}", i));
            self.store.insert(request).await?;
        }

        if count > 0 {
            info!(count, "Seeded work requests");
            self.feed(count).await?;
        }
        Ok(())
    }

    /// Queue a dispatch message for up to `count` requests ready to process
    ///
    /// Requests the selector marks for deletion are removed from the store.
    /// Returns the number of messages queued.
    pub async fn feed(&self, count: usize) -> Result<usize, SeedError> {
        let selected = self.selector.select(count).await?;
        for candidate in &selected.to_process {
            let body = RequestMessage::new(candidate.request.id.as_str()).to_body();
            self.queue.enqueue(body).await?;
        }
        self.selector.delete_selected(&selected).await?;

        info!(
            queued = selected.to_process.len(),
            deleted = selected.to_delete.len(),
            skipped = selected.skipped,
            "Fed work queue"
        );
        Ok(selected.to_process.len())
    }

    /// Wire a worker to this environment
    pub fn worker(&self, config: WorkerConfig) -> Worker {
        let dispatcher = TaskDispatcher::new(self.backend.clone(), config.dispatcher.clone());
        Worker::new(config, self.store.clone(), self.queue.clone(), dispatcher)
    }

    /// Advance the simulated pool every tick until the handle is aborted
    pub fn spawn_simulator(&self) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let tick_interval = self.tick_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                backend.tick();
                debug!("Simulated pool advanced");
            }
        })
    }
}
