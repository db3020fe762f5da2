//! # Event queue
//!
//! Durable FIFO buffer between ingestion and the worker pool, implemented on
//! top of a PostgreSQL table. Entries are removed at dequeue time with a
//! `FOR UPDATE SKIP LOCKED` pop, so each entry reaches at most one worker; a
//! worker crash between dequeue and commit loses only that in-flight entry.
//! Requeues after a failed commit are a legitimate duplicate source, which
//! the dedup store masks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::event::Event;

/// Enumeration of errors for operations with the event queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// The seam between ingestion and the workers. The production implementation
/// is [`PgEventQueue`]; [`MemoryEventQueue`] is a non-durable test double.
#[async_trait]
pub trait EventQueue {
    /// Append an event; returns once the entry is durably recorded.
    async fn enqueue(&self, event: &Event) -> QueueResult<()>;

    /// Block up to `timeout` for the next entry in FIFO order. `None` on
    /// timeout. The entry is removed from the queue before it is returned.
    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Event>>;

    /// Best-effort snapshot of the current depth.
    async fn size(&self) -> QueueResult<i64>;

    /// Implementation tag, surfaced by the queue stats endpoint.
    fn kind(&self) -> &'static str;
}

/// A queue implemented on top of a PostgreSQL table. Multiple logical queues
/// share the table, scoped by name.
pub struct PgEventQueue {
    /// A name to identify this queue as multiple may share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
    /// How long to sleep between polls while waiting for an entry.
    poll_interval: Duration,
}

impl PgEventQueue {
    pub fn new(name: String, pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            name,
            pool,
            poll_interval,
        }
    }

    /// Pop the oldest entry, if any. The CTE locks exactly one row with
    /// SKIP LOCKED so competing consumers never double-deliver, and the
    /// DELETE removes it in the same statement.
    async fn try_pop(&self) -> QueueResult<Option<Event>> {
        let row: Option<(sqlx::types::Json<Event>,)> = sqlx::query_as(
            r#"
WITH next_entry AS (
    SELECT id
    FROM event_queue
    WHERE queue = $1
    ORDER BY id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
DELETE FROM event_queue
WHERE id IN (SELECT id FROM next_entry)
RETURNING event
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "DELETE".to_owned(),
            error,
        })?;

        Ok(row.map(|(event,)| event.0))
    }
}

#[async_trait]
impl EventQueue for PgEventQueue {
    async fn enqueue(&self, event: &Event) -> QueueResult<()> {
        sqlx::query("INSERT INTO event_queue (queue, event, created_at) VALUES ($1, $2, NOW())")
            .bind(&self.name)
            .bind(sqlx::types::Json(event))
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Event>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(event) = self.try_pop().await? {
                return Ok(Some(event));
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn size(&self) -> QueueResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM event_queue WHERE queue = $1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

/// In-memory, non-durable queue used by tests (`USE_INMEMORY_QUEUE=true`).
/// When empty, `dequeue` sleeps once for the full timeout and re-checks,
/// which keeps worker loops from spinning without a database round-trip.
#[derive(Default)]
pub struct MemoryEventQueue {
    items: Mutex<VecDeque<Event>>,
}

impl MemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop(&self) -> Option<Event> {
        self.items
            .lock()
            .expect("poisoned MemoryEventQueue mutex")
            .pop_front()
    }
}

#[async_trait]
impl EventQueue for MemoryEventQueue {
    async fn enqueue(&self, event: &Event) -> QueueResult<()> {
        self.items
            .lock()
            .expect("poisoned MemoryEventQueue mutex")
            .push_back(event.clone());

        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Event>> {
        if let Some(event) = self.pop() {
            return Ok(Some(event));
        }
        tokio::time::sleep(timeout).await;
        Ok(self.pop())
    }

    async fn size(&self) -> QueueResult<i64> {
        Ok(self
            .items
            .lock()
            .expect("poisoned MemoryEventQueue mutex")
            .len() as i64)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
