use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CompletionMessage, DurableQueue, LeaseHandle, LeasedMessage, QueueError};
use crate::core::clock::Clock;
use crate::platform::{NativePlatform, Platform};

/// Queue persisted in a SQLite file.
///
/// A lease is a `visible_at` timestamp in the future plus a random token;
/// expiry is implicit, so a crashed consumer's messages come back on their own.
/// Messages delivered `max_dequeue_count` times are moved to `queue_poison`.
pub struct SqliteQueue {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    max_dequeue_count: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoisonedMessage {
    pub id: i64,
    pub body: String,
    pub dequeue_count: u32,
}

impl SqliteQueue {
    pub async fn open<P: AsRef<Path>>(
        path: P,
        clock: Arc<dyn Clock>,
        max_dequeue_count: u32,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        info!("Opened queue database at {}", path.display());
        Self::with_connection(db, clock, max_dequeue_count)
    }

    #[cfg(test)]
    pub fn open_in_memory(clock: Arc<dyn Clock>, max_dequeue_count: u32) -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?, clock, max_dequeue_count)
    }

    fn with_connection(
        db: Connection,
        clock: Arc<dyn Clock>,
        max_dequeue_count: u32,
    ) -> Result<Self, QueueError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                dequeue_count INTEGER NOT NULL DEFAULT 0,
                lease_token TEXT,
                enqueued_at INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_visible ON queue_messages (visible_at, id)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS queue_poison (
                id INTEGER PRIMARY KEY,
                body TEXT NOT NULL,
                dequeue_count INTEGER NOT NULL,
                poisoned_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            clock,
            max_dequeue_count: max_dequeue_count.max(1),
        })
    }

    /// Messages waiting or currently leased.
    pub async fn depth(&self) -> Result<usize, QueueError> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM queue_messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub async fn poisoned(&self) -> Result<Vec<PoisonedMessage>, QueueError> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT id, body, dequeue_count FROM queue_poison ORDER BY id")?;

        let rows = stmt.query_map([], |row| {
            Ok(PoisonedMessage {
                id: row.get(0)?,
                body: row.get(1)?,
                dequeue_count: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[async_trait]
impl DurableQueue for SqliteQueue {
    async fn enqueue(&self, message: &CompletionMessage) -> Result<(), QueueError> {
        let body = serde_json::to_string(message)?;
        let now = self.clock.now().timestamp_millis();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO queue_messages (body, visible_at, enqueued_at) VALUES (?1, ?2, ?2)",
            params![body, now],
        )?;
        debug!("Enqueued completion message for {}", message);
        Ok(())
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedMessage>, QueueError> {
        let now = self.clock.now().timestamp_millis();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        loop {
            let row = tx
                .query_row(
                    "SELECT id, body, dequeue_count FROM queue_messages
                     WHERE visible_at <= ?1 ORDER BY visible_at, id LIMIT 1",
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, body, dequeue_count)) = row else {
                tx.commit()?;
                return Ok(None);
            };

            let parsed = serde_json::from_str::<CompletionMessage>(&body);
            if dequeue_count >= self.max_dequeue_count || parsed.is_err() {
                warn!(
                    "Moving message {} to poison table after {} deliveries: {}",
                    id, dequeue_count, body
                );
                tx.execute(
                    "INSERT OR REPLACE INTO queue_poison (id, body, dequeue_count, poisoned_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, body, dequeue_count, now],
                )?;
                tx.execute("DELETE FROM queue_messages WHERE id = ?1", params![id])?;
                continue;
            }

            let token = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_messages
                 SET visible_at = ?1, dequeue_count = dequeue_count + 1, lease_token = ?2
                 WHERE id = ?3",
                params![now.saturating_add(lease_ms), token, id],
            )?;
            tx.commit()?;

            return Ok(Some(LeasedMessage {
                message: parsed?,
                handle: LeaseHandle { id, token },
                dequeue_count: dequeue_count + 1,
            }));
        }
    }

    async fn delete(&self, handle: &LeaseHandle) -> Result<(), QueueError> {
        let db = self.db.lock().await;
        let rows_deleted = db.execute(
            "DELETE FROM queue_messages WHERE id = ?1 AND lease_token = ?2",
            params![handle.id, handle.token],
        )?;
        if rows_deleted == 0 {
            // Lease expired and another consumer holds the message now.
            warn!("Lease on message {} was lost before delete", handle.id);
        }
        Ok(())
    }

    async fn release(
        &self,
        handle: &LeaseHandle,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let db = self.db.lock().await;
        let rows_updated = db.execute(
            "UPDATE queue_messages
             SET visible_at = ?1, dequeue_count = MAX(dequeue_count - 1, 0), lease_token = NULL
             WHERE id = ?2 AND lease_token = ?3",
            params![visible_at.timestamp_millis(), handle.id, handle.token],
        )?;
        if rows_updated == 0 {
            warn!("Lease on message {} was lost before release", handle.id);
        } else {
            debug!("Released message {} until {}", handle.id, visible_at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn message(run_id: i64) -> CompletionMessage {
        CompletionMessage {
            owner: "contoso".to_string(),
            repository: "widgets".to_string(),
            run_id,
        }
    }

    fn queue(max_dequeue_count: u32) -> (Arc<ManualClock>, SqliteQueue) {
        let clock = Arc::new(ManualClock::new("2024-03-01T10:00:00Z".parse().unwrap()));
        let queue = SqliteQueue::open_in_memory(clock.clone(), max_dequeue_count).unwrap();
        (clock, queue)
    }

    const LEASE: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn dequeues_in_fifo_order_and_hides_leased_messages() {
        let (_clock, queue) = queue(5);
        queue.enqueue(&message(1)).await.unwrap();
        queue.enqueue(&message(2)).await.unwrap();

        let first = queue.dequeue(LEASE).await.unwrap().unwrap();
        let second = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(first.message.run_id, 1);
        assert_eq!(second.message.run_id, 2);
        assert_eq!(first.dequeue_count, 1);
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_message_is_gone() {
        let (clock, queue) = queue(5);
        queue.enqueue(&message(1)).await.unwrap();

        let leased = queue.dequeue(LEASE).await.unwrap().unwrap();
        queue.delete(&leased.handle).await.unwrap();

        clock.advance(chrono::Duration::minutes(10));
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_redelivers_and_stale_handle_cannot_delete() {
        let (clock, queue) = queue(5);
        queue.enqueue(&message(7)).await.unwrap();

        let first = queue.dequeue(LEASE).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(301));

        let second = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(second.message.run_id, 7);
        assert_eq!(second.dequeue_count, 2);
        assert_ne!(first.handle.token, second.handle.token);

        queue.delete(&first.handle).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);

        queue.delete(&second.handle).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn message_exceeding_delivery_budget_is_poisoned() {
        let (clock, queue) = queue(2);
        queue.enqueue(&message(9)).await.unwrap();

        for _ in 0..2 {
            assert!(queue.dequeue(LEASE).await.unwrap().is_some());
            clock.advance(chrono::Duration::seconds(301));
        }

        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
        let poisoned = queue.poisoned().await.unwrap();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].dequeue_count, 2);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn released_message_returns_at_visible_at_without_spending_a_delivery() {
        let (clock, queue) = queue(2);
        queue.enqueue(&message(11)).await.unwrap();

        for _ in 0..4 {
            let leased = queue.dequeue(LEASE).await.unwrap().unwrap();
            assert_eq!(leased.dequeue_count, 1);
            let visible_at = clock.now() + chrono::Duration::minutes(30);
            queue.release(&leased.handle, visible_at).await.unwrap();

            clock.advance(chrono::Duration::minutes(29));
            assert!(queue.dequeue(LEASE).await.unwrap().is_none());
            clock.advance(chrono::Duration::minutes(1));
        }

        assert!(queue.poisoned().await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_handle_cannot_release() {
        let (clock, queue) = queue(5);
        queue.enqueue(&message(12)).await.unwrap();

        let first = queue.dequeue(LEASE).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(301));
        let second = queue.dequeue(LEASE).await.unwrap().unwrap();

        queue
            .release(&first.handle, clock.now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());

        queue.delete(&second.handle).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("queue.db");
        let clock = Arc::new(ManualClock::new("2024-03-01T10:00:00Z".parse().unwrap()));

        let queue = SqliteQueue::open(&path, clock, 5).await.unwrap();
        queue.enqueue(&message(3)).await.unwrap();

        assert!(path.exists());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
