//! In-memory implementation of WorkQueue for testing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::*;

/// Internal message state
struct StoredMessage {
    id: String,
    body: String,
    pop_receipt: Option<String>,
    dequeue_count: u32,
    visible_at: Instant,
}

/// In-memory implementation of WorkQueue
///
/// Visibility timeouts are measured with `tokio::time::Instant`, so tests
/// running with paused time can advance past a lease.
pub struct InMemoryWorkQueue {
    config: QueueConfig,
    messages: Mutex<VecDeque<StoredMessage>>,
    dead_letters: Mutex<Vec<QueueMessage>>,
    receive_calls: AtomicUsize,
    deleted: AtomicUsize,
}

impl InMemoryWorkQueue {
    /// Create a new in-memory queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            messages: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            receive_calls: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
        }
    }

    /// Number of messages still in the queue (visible or leased)
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Check whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Number of `receive` calls made
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::Relaxed)
    }

    /// Number of messages deleted
    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Messages moved to the dead-letter queue
    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.dead_letters.lock().clone()
    }

    fn lease(&self, messages: &mut VecDeque<StoredMessage>, max: usize) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut leased = Vec::new();
        let mut index = 0;

        while index < messages.len() && leased.len() < max {
            if messages[index].visible_at > now {
                index += 1;
                continue;
            }

            if messages[index].dequeue_count >= self.config.max_dequeue_count {
                if let Some(expired) = messages.remove(index) {
                    tracing::warn!(
                        message_id = %expired.id,
                        dequeue_count = expired.dequeue_count,
                        "Message exceeded dequeue limit, moving to dead-letter queue"
                    );
                    self.dead_letters.lock().push(QueueMessage {
                        id: expired.id,
                        body: expired.body,
                        pop_receipt: expired.pop_receipt.unwrap_or_default(),
                        dequeue_count: expired.dequeue_count,
                    });
                }
                continue;
            }

            let message = &mut messages[index];
            let receipt = Uuid::now_v7().to_string();
            message.dequeue_count += 1;
            message.pop_receipt = Some(receipt.clone());
            message.visible_at = now + self.config.visibility_timeout;

            leased.push(QueueMessage {
                id: message.id.clone(),
                body: message.body.clone(),
                pop_receipt: receipt,
                dequeue_count: message.dequeue_count,
            });
            index += 1;
        }

        leased
    }

    fn take_leased(&self, message: &QueueMessage) -> Result<StoredMessage, QueueError> {
        let mut messages = self.messages.lock();
        let index = messages
            .iter()
            .position(|m| m.id == message.id)
            .ok_or_else(|| QueueError::MessageNotFound(message.id.clone()))?;

        if messages[index].pop_receipt.as_deref() != Some(message.pop_receipt.as_str()) {
            return Err(QueueError::PopReceiptMismatch(message.id.clone()));
        }

        messages
            .remove(index)
            .ok_or_else(|| QueueError::MessageNotFound(message.id.clone()))
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, body: String) -> Result<String, QueueError> {
        let id = Uuid::now_v7().to_string();
        self.messages.lock().push_back(StoredMessage {
            id: id.clone(),
            body,
            pop_receipt: None,
            dequeue_count: 0,
            visible_at: Instant::now(),
        });
        Ok(id)
    }

    async fn receive(&self, max_count: usize) -> Result<Vec<QueueMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::Relaxed);

        let mut received = Vec::new();
        let mut messages = self.messages.lock();

        // Read in service-sized batches until satisfied or nothing is visible
        while received.len() < max_count {
            let batch = (max_count - received.len()).min(self.config.max_messages_per_receive);
            let leased = self.lease(&mut messages, batch);
            if leased.is_empty() {
                break;
            }
            received.extend(leased);
        }

        Ok(received)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.take_leased(message)?;
        self.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn move_to_dead_letter(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let stored = self.take_leased(message)?;
        self.dead_letters.lock().push(QueueMessage {
            id: stored.id,
            body: stored.body,
            pop_receipt: message.pop_receipt.clone(),
            dequeue_count: stored.dequeue_count,
        });
        Ok(())
    }
}
