//! Work request selection by run state, retry count and age

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::persistence::{RunState, StoreError, WorkItemStore, WorkRequest};

/// Why a request was routed where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Never dispatched
    Pending,
    /// Running or failed, and untouched for at least the retry interval
    Retry,
    /// Already finished
    Completed,
    /// Retry budget exhausted
    NoRetry,
}

/// Routing decision for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Process(Condition),
    Delete(Condition),
    /// No action this cycle
    Skip,
}

/// Classify a request
///
/// Rules are applied in order: completed requests are deleted regardless of
/// retry count, exhausted requests are deleted regardless of run state.
pub fn classify(
    request: &WorkRequest,
    now: DateTime<Utc>,
    retry_interval: Duration,
    max_retry_count: u32,
) -> Disposition {
    if request.run_state == RunState::Completed {
        return Disposition::Delete(Condition::Completed);
    }

    if request.retry_count >= max_retry_count {
        return Disposition::Delete(Condition::NoRetry);
    }

    match request.run_state {
        RunState::Pending => Disposition::Process(Condition::Pending),
        RunState::Running | RunState::Failed => {
            let elapsed = (now - request.last_updated_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= retry_interval {
                Disposition::Process(Condition::Retry)
            } else {
                Disposition::Skip
            }
        }
        RunState::Completed => Disposition::Delete(Condition::Completed),
    }
}

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorConfig {
    /// Minimum quiet time before a running or failed request is retried
    #[serde(with = "crate::persistence::duration_millis")]
    pub retry_interval: Duration,

    /// Requests with this many retries are deleted
    pub max_retry_count: u32,

    /// Records read per store page
    pub page_size: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(15 * 60),
            max_retry_count: 3,
            page_size: 100,
        }
    }
}

impl SelectorConfig {
    /// Set the retry interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the maximum retry count
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Set the page size
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }
}

/// A request chosen for processing or deletion, with its reason
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedRequest {
    pub request: WorkRequest,
    pub condition: Condition,
}

/// Result of a selection pass
#[derive(Debug, Clone, Default)]
pub struct SelectedRequests {
    pub to_process: Vec<SelectedRequest>,
    pub to_delete: Vec<SelectedRequest>,
    pub skipped: usize,
}

/// Pages through the store and partitions requests into process/delete sets
pub struct RequestSelector {
    store: Arc<dyn WorkItemStore>,
    config: SelectorConfig,
}

impl RequestSelector {
    /// Create a new selector
    pub fn new(store: Arc<dyn WorkItemStore>, config: SelectorConfig) -> Self {
        Self { store, config }
    }

    /// Selector configuration
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Classify a request against this selector's thresholds
    pub fn classify(&self, request: &WorkRequest, now: DateTime<Utc>) -> Disposition {
        classify(
            request,
            now,
            self.config.retry_interval,
            self.config.max_retry_count,
        )
    }

    /// Collect up to `count` requests to process
    ///
    /// Reads pages until enough requests are found or the store is exhausted.
    /// Delete candidates found along the way are returned as well.
    #[instrument(skip(self))]
    pub async fn select(&self, count: usize) -> Result<SelectedRequests, StoreError> {
        let now = Utc::now();
        let mut selected = SelectedRequests::default();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .store
                .read_page(continuation.as_deref(), self.config.page_size)
                .await?;

            for request in page.items {
                if selected.to_process.len() >= count {
                    break;
                }

                match self.classify(&request, now) {
                    Disposition::Process(condition) => {
                        selected.to_process.push(SelectedRequest { request, condition })
                    }
                    Disposition::Delete(condition) => {
                        selected.to_delete.push(SelectedRequest { request, condition })
                    }
                    Disposition::Skip => selected.skipped += 1,
                }
            }

            continuation = page.continuation;
            if selected.to_process.len() >= count || continuation.is_none() {
                break;
            }
        }

        debug!(
            to_process = selected.to_process.len(),
            to_delete = selected.to_delete.len(),
            skipped = selected.skipped,
            "Selected work requests"
        );

        Ok(selected)
    }

    /// Delete the requests of the delete set
    pub async fn delete_selected(&self, selected: &SelectedRequests) -> Result<(), StoreError> {
        if selected.to_delete.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = selected
            .to_delete
            .iter()
            .map(|s| s.request.id.clone())
            .collect();
        self.store.delete_many(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkItemStore;

    const INTERVAL: Duration = Duration::from_secs(600);

    fn request(id: &str, state: RunState, retries: u32, age_secs: i64) -> WorkRequest {
        WorkRequest::pending(id, "key")
            .with_run_state(state)
            .with_retry_count(retries)
            .with_last_updated_at(Utc::now() - chrono::Duration::seconds(age_secs))
    }

    #[test]
    fn test_completed_always_deleted() {
        let now = Utc::now();
        for retries in [0, 1, 10] {
            let r = request("a", RunState::Completed, retries, 0);
            assert_eq!(
                classify(&r, now, INTERVAL, 3),
                Disposition::Delete(Condition::Completed)
            );
        }
    }

    #[test]
    fn test_exhausted_retries_deleted_even_if_pending() {
        let r = request("a", RunState::Pending, 3, 0);
        assert_eq!(
            classify(&r, Utc::now(), INTERVAL, 3),
            Disposition::Delete(Condition::NoRetry)
        );
    }

    #[test]
    fn test_pending_processed() {
        let r = request("a", RunState::Pending, 2, 0);
        assert_eq!(
            classify(&r, Utc::now(), INTERVAL, 3),
            Disposition::Process(Condition::Pending)
        );
    }

    #[test]
    fn test_stale_running_and_failed_retried() {
        let now = Utc::now();
        for state in [RunState::Running, RunState::Failed] {
            let r = request("a", state, 1, 601);
            assert_eq!(
                classify(&r, now, INTERVAL, 3),
                Disposition::Process(Condition::Retry)
            );
        }
    }

    #[test]
    fn test_recent_running_skipped() {
        let r = request("a", RunState::Running, 0, 30);
        assert_eq!(classify(&r, Utc::now(), INTERVAL, 3), Disposition::Skip);
    }

    #[test]
    fn test_future_timestamp_skipped() {
        let r = request("a", RunState::Failed, 0, -120);
        assert_eq!(classify(&r, Utc::now(), INTERVAL, 3), Disposition::Skip);
    }

    #[tokio::test]
    async fn test_select_pages_until_count_satisfied() {
        let store = Arc::new(InMemoryWorkItemStore::with_records(vec![
            request("a", RunState::Completed, 0, 0),
            request("b", RunState::Pending, 0, 0),
            request("c", RunState::Running, 0, 10),
            request("d", RunState::Pending, 5, 0),
            request("e", RunState::Failed, 1, 3600),
            request("f", RunState::Pending, 0, 0),
        ]));

        let selector = RequestSelector::new(
            store.clone(),
            SelectorConfig::default()
                .with_retry_interval(INTERVAL)
                .with_page_size(2),
        );

        let selected = selector.select(2).await.unwrap();
        let process: Vec<&str> = selected
            .to_process
            .iter()
            .map(|s| s.request.id.as_str())
            .collect();
        assert_eq!(process, vec!["b", "e"]);
        assert_eq!(selected.to_process[1].condition, Condition::Retry);

        let delete: Vec<&str> = selected
            .to_delete
            .iter()
            .map(|s| s.request.id.as_str())
            .collect();
        assert_eq!(delete, vec!["a", "d"]);
        assert_eq!(selected.skipped, 1);
    }

    #[tokio::test]
    async fn test_select_stops_when_store_exhausted() {
        let store = Arc::new(InMemoryWorkItemStore::with_records(vec![
            request("a", RunState::Pending, 0, 0),
            request("b", RunState::Completed, 0, 0),
        ]));
        let selector = RequestSelector::new(store.clone(), SelectorConfig::default());

        let selected = selector.select(10).await.unwrap();
        assert_eq!(selected.to_process.len(), 1);

        selector.delete_selected(&selected).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("b").is_none());
    }
}
