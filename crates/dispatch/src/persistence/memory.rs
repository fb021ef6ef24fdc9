//! In-memory implementation of WorkItemStore for testing

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::*;

/// In-memory implementation of WorkItemStore
///
/// Records are kept ordered by id, which is also the paging order.
/// Continuation tokens are the id of the last record returned.
///
/// # Example
///
/// ```
/// use scanfleet_dispatch::persistence::InMemoryWorkItemStore;
///
/// let store = InMemoryWorkItemStore::new();
/// assert_eq!(store.len(), 0);
/// ```
pub struct InMemoryWorkItemStore {
    records: RwLock<BTreeMap<String, WorkRequest>>,
    update_calls: AtomicUsize,
    injected_conflicts: AtomicUsize,
}

impl InMemoryWorkItemStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            update_calls: AtomicUsize::new(0),
            injected_conflicts: AtomicUsize::new(0),
        }
    }

    /// Create a store pre-populated with records
    pub fn with_records(records: impl IntoIterator<Item = WorkRequest>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    /// Get the number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Get a copy of a record
    pub fn get(&self, id: &str) -> Option<WorkRequest> {
        self.records.read().get(id).cloned()
    }

    /// Number of update calls received (including rejected ones)
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::Relaxed)
    }

    /// Make the next `count` updates fail with a concurrency conflict
    ///
    /// Each injected conflict also bumps the stored version, as a competing
    /// writer would.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::Relaxed);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryWorkItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn read_many(&self, ids: &[String]) -> Result<Vec<WorkRequest>, StoreError> {
        let records = self.records.read();
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn read_page(
        &self,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<RequestPage, StoreError> {
        let records = self.records.read();

        let lower = match continuation {
            Some(token) if token.is_empty() => {
                return Err(StoreError::InvalidContinuation(token.to_string()))
            }
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };

        let mut iter = records.range((lower, Bound::Unbounded));
        let items: Vec<WorkRequest> = iter
            .by_ref()
            .take(page_size.max(1))
            .map(|(_, r)| r.clone())
            .collect();

        let continuation = match (items.last(), iter.next()) {
            (Some(last), Some(_)) => Some(last.id.clone()),
            _ => None,
        };

        Ok(RequestPage {
            items,
            continuation,
        })
    }

    async fn insert(&self, mut record: WorkRequest) -> Result<WorkRequest, StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }

        record.version = 1;
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, mut record: WorkRequest) -> Result<WorkRequest, StoreError> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);

        let mut records = self.records.write();
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;

        if self.take_injected_conflict() {
            stored.version += 1;
        }

        if stored.version != record.version {
            return Err(StoreError::ConcurrencyConflict {
                id: record.id,
                expected: record.version,
                actual: stored.version,
            });
        }

        record.version += 1;
        *stored = record.clone();
        Ok(record)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut records = self.records.write();
        for id in ids {
            records.remove(id);
        }
        Ok(())
    }
}
