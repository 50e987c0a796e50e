//! At-least-once queue of run completion messages.

mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteQueue;

/// Identifies a run that finished upstream and needs ingesting.
///
/// Wire shape: `{"owner": "...", "repository": "...", "runId": 123}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub owner: String,
    pub repository: String,
    pub run_id: i64,
}

impl std::fmt::Display for CompletionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repository, self.run_id)
    }
}

/// Proof of an exclusive lease; required to acknowledge a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    pub id: i64,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub message: CompletionMessage,
    pub handle: LeaseHandle,
    /// 1 on first delivery.
    pub dequeue_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("queue message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, message: &CompletionMessage) -> Result<(), QueueError>;

    /// Lease the next visible message. It stays invisible to other consumers
    /// for `lease` and is redelivered afterwards unless deleted.
    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedMessage>, QueueError>;

    async fn delete(&self, handle: &LeaseHandle) -> Result<(), QueueError>;

    /// Give a leased message back without counting the delivery. It becomes
    /// visible again at `visible_at`.
    async fn release(
        &self,
        handle: &LeaseHandle,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;
}
