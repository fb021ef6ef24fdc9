//! WorkQueue trait definition
//!
//! A visibility-timeout message queue: received messages are leased rather
//! than removed, and reappear unless deleted with their current pop receipt.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Message not found (already deleted or dead-lettered)
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// The message was re-leased since it was received
    #[error("pop receipt mismatch for message {0}")]
    PopReceiptMismatch(String),

    /// Backend error
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// How long a received message stays hidden from other receivers
    #[serde(with = "duration_millis")]
    pub visibility_timeout: Duration,

    /// Messages received more often than this are moved to the dead-letter queue
    pub max_dequeue_count: u32,

    /// Per-call receive cap of the underlying queue service
    pub max_messages_per_receive: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_dequeue_count: 2,
            max_messages_per_receive: 32,
        }
    }
}

impl QueueConfig {
    /// Create a new queue configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the dead-letter threshold
    pub fn with_max_dequeue_count(mut self, count: u32) -> Self {
        self.max_dequeue_count = count.max(1);
        self
    }

    /// Set the per-call receive cap
    pub fn with_max_messages_per_receive(mut self, count: usize) -> Self {
        self.max_messages_per_receive = count.max(1);
        self
    }
}

/// A leased queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub pop_receipt: String,
    pub dequeue_count: u32,
}

impl QueueMessage {
    /// Parse the body as a request message
    pub fn request(&self) -> Result<RequestMessage, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Body of a dispatch message: names the work request to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: String,
}

impl RequestMessage {
    /// Create a message body for a work request id
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Serialize to a message body
    pub fn to_body(&self) -> String {
        serde_json::json!({ "id": self.id }).to_string()
    }
}

/// Visibility-timeout message queue
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Add a message; returns its id
    async fn enqueue(&self, body: String) -> Result<String, QueueError>;

    /// Lease up to `max_count` visible messages
    ///
    /// Messages over the dead-letter threshold are moved aside and not returned.
    async fn receive(&self, max_count: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a leased message
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Move a leased message to the dead-letter queue
    async fn move_to_dead_letter(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
