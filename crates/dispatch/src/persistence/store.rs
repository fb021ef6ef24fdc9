//! WorkItemStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record not found
    #[error("work request not found: {0}")]
    NotFound(String),

    /// Record already exists
    #[error("work request already exists: {0}")]
    AlreadyExists(String),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {id}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Invalid continuation token
    #[error("invalid continuation token: {0}")]
    InvalidContinuation(String),

    /// Backend error
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether a re-read and retry may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Run state of a persisted work request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting to be dispatched
    Pending,

    /// Dispatched to the pool
    Running,

    /// Finished successfully
    Completed,

    /// Finished with a failure
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A persisted work request
///
/// `version` plays the role of an etag: updates are accepted only when the
/// caller's version matches the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: String,
    pub correlation_key: String,
    pub run_state: RunState,
    pub retry_count: u32,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl WorkRequest {
    /// Create a new pending request
    pub fn pending(id: impl Into<String>, correlation_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            correlation_key: correlation_key.into(),
            run_state: RunState::Pending,
            retry_count: 0,
            last_updated_at: Utc::now(),
            error: None,
            version: 0,
        }
    }

    /// Set the run state
    pub fn with_run_state(mut self, run_state: RunState) -> Self {
        self.run_state = run_state;
        self
    }

    /// Set the retry count
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the last update time
    pub fn with_last_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated_at = at;
        self
    }
}

/// One page of a continuation-token listing
#[derive(Debug, Clone, Default)]
pub struct RequestPage {
    pub items: Vec<WorkRequest>,
    /// Token for the next page, `None` once the store is exhausted
    pub continuation: Option<String>,
}

/// Store for work request records
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkItemStore: Send + Sync + 'static {
    /// Read the records with the given ids; unknown ids are omitted
    async fn read_many(&self, ids: &[String]) -> Result<Vec<WorkRequest>, StoreError>;

    /// Read one page of records in a stable order
    async fn read_page(
        &self,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<RequestPage, StoreError>;

    /// Insert a new record
    async fn insert(&self, record: WorkRequest) -> Result<WorkRequest, StoreError>;

    /// Conditionally update a record (with optimistic concurrency)
    ///
    /// Returns the stored record with its version bumped.
    async fn update(&self, record: WorkRequest) -> Result<WorkRequest, StoreError>;

    /// Delete records by id; unknown ids are ignored
    async fn delete_many(&self, ids: &[String]) -> Result<(), StoreError>;
}
