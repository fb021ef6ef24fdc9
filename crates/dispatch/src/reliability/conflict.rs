//! Bounded retry-on-conflict for work request updates

use tracing::debug;

use super::RetryPolicy;
use crate::persistence::{StoreError, WorkItemStore, WorkRequest};

/// Read-modify-write a record, retrying optimistic-concurrency conflicts
///
/// `mutate` is applied to a fresh copy of the record on every attempt and
/// returns `false` when no write is needed. Returns `Ok(None)` if the record
/// does not exist, otherwise the record as stored after the call.
pub async fn update_with_retry<F>(
    store: &dyn WorkItemStore,
    id: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<Option<WorkRequest>, StoreError>
where
    F: FnMut(&mut WorkRequest) -> bool + Send,
{
    let ids = [id.to_string()];
    let mut attempt = 1;

    loop {
        let Some(mut record) = store.read_many(&ids).await?.into_iter().next() else {
            return Ok(None);
        };

        if !mutate(&mut record) {
            return Ok(Some(record));
        }

        match store.update(record).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(e) if e.is_conflict() && policy.has_attempts_remaining(attempt) => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Update conflicted, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
