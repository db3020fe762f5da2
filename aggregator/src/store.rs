//! # DedupStore
//!
//! Durable persistence of events and aggregate counters, backed by a
//! PostgreSQL table with a unique constraint on `(topic, event_id)`. The
//! constraint is the only serialization point in the pipeline: any number of
//! workers may race on the same key and exactly one insert wins.

use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use thiserror::Error;

use crate::event::{Event, StoredEvent};

/// Enumeration of errors for operations with the dedup store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

impl StoreError {
    /// Whether retrying the failed operation could succeed. Duplicate keys
    /// never surface here; `try_insert` reports them as a normal outcome.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionError { .. } => true,
            StoreError::QueryError { error, .. } => is_transient_error(error),
        }
    }
}

/// Classify a sqlx error as transient by SQLSTATE, falling back to message
/// heuristics when the driver reports no code.
///
/// Covered classes: 08 (connection), 53 (insufficient resources), 57
/// (operator intervention, including statement_timeout), 58 (system error),
/// plus 40001 (serialization failure) and 40P01 (deadlock detected).
pub fn is_transient_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db_error) => {
            if let Some(code) = db_error.code() {
                let code = code.as_ref();
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40P01"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("deadlock")
                    || msg.contains("serialization")
            }
        }
        _ => false,
    }
}

/// The result of attempting to record an event. A two-variant outcome rather
/// than an error: duplicates drive counter choice, they are not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The event was new and is now durably stored.
    Inserted,
    /// An event with the same `(topic, event_id)` already exists; no rows
    /// were modified.
    Duplicate,
}

/// Per-batch insert tally returned by [`DedupStore::apply_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: i64,
    pub duplicates: i64,
}

/// Point-in-time snapshot of the aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Counters {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Handle on the events and metrics tables. Cheap to clone; each operation
/// acquires its own connection from the pool.
#[derive(Clone)]
pub struct DedupStore {
    pool: PgPool,
}

impl DedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attempt to record `event`, returning `Duplicate` without modifying any
    /// row when the `(topic, event_id)` key is already present. Runs under
    /// read-committed isolation; the unique constraint serializes concurrent
    /// inserts of the same key so that exactly one caller sees `Inserted`.
    pub async fn try_insert(&self, event: &Event) -> StoreResult<InsertOutcome> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Self::try_insert_on(&mut conn, event).await
    }

    async fn try_insert_on(conn: &mut PgConnection, event: &Event) -> StoreResult<InsertOutcome> {
        let result = sqlx::query(
            r#"
INSERT INTO events (topic, event_id, "timestamp", source, payload, processed_at)
VALUES ($1, $2, $3, $4, $5, NOW())
ON CONFLICT (topic, event_id) DO NOTHING
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&event.payload)
        .execute(conn)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Duplicate)
        }
    }

    /// Record one event and the matching counter in a single transaction:
    /// `unique_processed` on `Inserted`, `duplicate_dropped` on `Duplicate`.
    /// The increment is a delta expression evaluated by the store, so lost
    /// updates are impossible at any isolation level. Safe to retry after a
    /// failed commit; the retried insert resolves to `Duplicate`.
    pub async fn apply_event(&self, event: &Event) -> StoreResult<InsertOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let outcome = Self::try_insert_on(&mut tx, event).await?;

        let query = match outcome {
            InsertOutcome::Inserted => {
                "UPDATE metrics SET unique_processed = unique_processed + 1 WHERE id = 1"
            }
            InsertOutcome::Duplicate => {
                "UPDATE metrics SET duplicate_dropped = duplicate_dropped + 1 WHERE id = 1"
            }
        };
        sqlx::query(query)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(outcome)
    }

    /// Record a whole batch in one transaction. Intra-batch duplicates hit
    /// the same unique constraint as cross-batch ones: the first occurrence
    /// inserts, the rest count as duplicates. Both counter deltas are applied
    /// at the end, inside the same transaction, so the counters and the row
    /// set agree at every commit boundary.
    pub async fn apply_batch(&self, events: &[Event]) -> StoreResult<BatchOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let mut inserted = 0i64;
        let mut duplicates = 0i64;
        for event in events {
            match Self::try_insert_on(&mut tx, event).await? {
                InsertOutcome::Inserted => inserted += 1,
                InsertOutcome::Duplicate => duplicates += 1,
            }
        }

        if inserted > 0 {
            sqlx::query("UPDATE metrics SET unique_processed = unique_processed + $1 WHERE id = 1")
                .bind(inserted)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }
        if duplicates > 0 {
            sqlx::query("UPDATE metrics SET duplicate_dropped = duplicate_dropped + $1 WHERE id = 1")
                .bind(duplicates)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(BatchOutcome {
            inserted,
            duplicates,
        })
    }

    /// Atomically add `count` to the `received` counter. Independent
    /// transaction, deliberately outside the insert transactions: `received`
    /// tracks acceptance, not processing.
    pub async fn increment_received(&self, count: i64) -> StoreResult<()> {
        sqlx::query("UPDATE metrics SET received = received + $1 WHERE id = 1")
            .bind(count)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Stored events of `topic`, newest event `timestamp` first, insert
    /// sequence breaking ties.
    pub async fn events_by_topic(
        &self,
        topic: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<StoredEvent>> {
        sqlx::query_as(
            r#"
SELECT id, topic, event_id, "timestamp", source, payload, processed_at
FROM events
WHERE topic = $1
ORDER BY "timestamp" DESC, id ASC
LIMIT $2 OFFSET $3
            "#,
        )
        .bind(topic)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Snapshot of the counters row. Read-committed; not required to agree
    /// with writes that are still in flight.
    pub async fn counters(&self) -> StoreResult<Counters> {
        sqlx::query_as(
            "SELECT received, unique_processed, duplicate_dropped FROM metrics WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Distinct topics with at least one stored event, in stable order.
    pub async fn topics(&self) -> StoreResult<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT topic FROM events ORDER BY topic")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Zero all three counters. Stored events are untouched, so
    /// `unique_processed` undercounts the row set until the operator also
    /// clears events.
    pub async fn reset_counters(&self) -> StoreResult<()> {
        sqlx::query(
            "UPDATE metrics SET received = 0, unique_processed = 0, duplicate_dropped = 0 WHERE id = 1",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Delete stored events, optionally restricted to one topic. Destructive
    /// operational aid; returns the number of rows removed.
    pub async fn delete_events(&self, topic: Option<&str>) -> StoreResult<u64> {
        let result = match topic {
            Some(topic) => {
                sqlx::query("DELETE FROM events WHERE topic = $1")
                    .bind(topic)
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("DELETE FROM events").execute(&self.pool).await,
        }
        .map_err(|error| StoreError::QueryError {
            command: "DELETE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected())
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::PgPool;

    fn event(topic: &str, event_id: &str, timestamp: &str) -> Event {
        Event {
            topic: topic.to_owned(),
            event_id: event_id.to_owned(),
            timestamp: timestamp.parse().unwrap(),
            source: "test".to_owned(),
            payload: json!({"n": 1}),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn apply_event_inserts_then_detects_duplicate(db: PgPool) {
        let store = DedupStore::new(db);
        let e = event("demo-topic", "event-001", "2024-12-12T10:00:00Z");

        assert_eq!(store.apply_event(&e).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.apply_event(&e).await.unwrap(),
            InsertOutcome::Duplicate
        );

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.unique_processed, 1);
        assert_eq!(counters.duplicate_dropped, 1);

        let rows = store.events_by_topic("demo-topic", 100, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, "event-001");
        assert_eq!(rows[0].payload, json!({"n": 1}));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn duplicate_keeps_first_payload(db: PgPool) {
        let store = DedupStore::new(db);
        let mut e = event("demo-topic", "event-001", "2024-12-12T10:00:00Z");
        store.apply_event(&e).await.unwrap();

        e.payload = json!({"n": 2});
        assert_eq!(
            store.apply_event(&e).await.unwrap(),
            InsertOutcome::Duplicate
        );

        let rows = store.events_by_topic("demo-topic", 100, 0).await.unwrap();
        assert_eq!(rows[0].payload, json!({"n": 1}));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn same_event_id_across_topics_both_insert(db: PgPool) {
        let store = DedupStore::new(db);
        let a = event("topic-a", "shared-id", "2024-12-12T10:00:00Z");
        let b = event("topic-b", "shared-id", "2024-12-12T10:00:00Z");

        assert_eq!(store.apply_event(&a).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.apply_event(&b).await.unwrap(), InsertOutcome::Inserted);

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.unique_processed, 2);
        assert_eq!(counters.duplicate_dropped, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn apply_batch_counts_intra_batch_duplicates(db: PgPool) {
        let store = DedupStore::new(db);
        let events = vec![
            event("batch-topic", "batch-001", "2024-12-12T10:00:00Z"),
            event("batch-topic", "batch-002", "2024-12-12T10:00:01Z"),
            event("batch-topic", "batch-003", "2024-12-12T10:00:02Z"),
            event("batch-topic", "batch-001", "2024-12-12T10:00:03Z"),
        ];

        let outcome = store.apply_batch(&events).await.unwrap();
        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.duplicates, 1);

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.unique_processed, 3);
        assert_eq!(counters.duplicate_dropped, 1);

        // Retrying the whole batch leaves previous inserts in place.
        let outcome = store.apply_batch(&events).await.unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.duplicates, 4);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn increment_received_is_cumulative(db: PgPool) {
        let store = DedupStore::new(db);
        store.increment_received(3).await.unwrap();
        store.increment_received(2).await.unwrap();

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.received, 5);
        assert_eq!(counters.unique_processed, 0);
        assert_eq!(counters.duplicate_dropped, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn events_by_topic_orders_by_timestamp_then_sequence(db: PgPool) {
        let store = DedupStore::new(db);
        // Two events share a timestamp; the earlier insert wins the tie.
        store
            .apply_event(&event("t", "old", "2024-12-12T09:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("t", "tie-first", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("t", "tie-second", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("other", "unrelated", "2024-12-12T11:00:00Z"))
            .await
            .unwrap();

        let rows = store.events_by_topic("t", 100, 0).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|row| row.event_id.as_str()).collect();
        assert_eq!(ids, vec!["tie-first", "tie-second", "old"]);

        let limited = store.events_by_topic("t", 1, 0).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].event_id, "tie-first");

        let offset = store.events_by_topic("t", 100, 2).await.unwrap();
        assert_eq!(offset.len(), 1);
        assert_eq!(offset[0].event_id, "old");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn topics_lists_distinct_topics_in_stable_order(db: PgPool) {
        let store = DedupStore::new(db);
        store
            .apply_event(&event("zebra", "1", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("alpha", "1", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("alpha", "2", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        assert_eq!(store.topics().await.unwrap(), vec!["alpha", "zebra"]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn reset_counters_zeroes_without_touching_events(db: PgPool) {
        let store = DedupStore::new(db);
        store.increment_received(2).await.unwrap();
        store
            .apply_event(&event("t", "1", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        store.reset_counters().await.unwrap();

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.received, 0);
        assert_eq!(counters.unique_processed, 0);
        assert_eq!(counters.duplicate_dropped, 0);
        assert_eq!(store.events_by_topic("t", 100, 0).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn delete_events_by_topic_and_all(db: PgPool) {
        let store = DedupStore::new(db);
        store
            .apply_event(&event("a", "1", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("a", "2", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("b", "1", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        assert_eq!(store.delete_events(Some("a")).await.unwrap(), 2);
        assert_eq!(store.events_by_topic("a", 100, 0).await.unwrap().len(), 0);
        assert_eq!(store.delete_events(None).await.unwrap(), 1);
        assert_eq!(store.topics().await.unwrap().len(), 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn a_fresh_store_on_the_same_database_still_deduplicates(db: PgPool) {
        // Restart survival: the unique constraint outlives any one process.
        let first = DedupStore::new(db.clone());
        let e = event("persist", "persist-event-before-crash", "2024-12-12T10:00:00Z");
        assert_eq!(first.apply_event(&e).await.unwrap(), InsertOutcome::Inserted);
        drop(first);

        let second = DedupStore::new(db);
        assert_eq!(
            second.apply_event(&e).await.unwrap(),
            InsertOutcome::Duplicate
        );
    }

    mod transient_classification {
        use super::super::is_transient_error;
        use sqlx::error::{DatabaseError, ErrorKind};
        use std::{borrow::Cow, error::Error as StdError, fmt};

        #[derive(Debug)]
        struct MockDbError {
            msg: &'static str,
            code: Option<&'static str>,
        }

        impl fmt::Display for MockDbError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.msg)
            }
        }

        impl StdError for MockDbError {}

        impl DatabaseError for MockDbError {
            fn message(&self) -> &str {
                self.msg
            }
            fn kind(&self) -> ErrorKind {
                ErrorKind::Other
            }
            fn code(&self) -> Option<Cow<'_, str>> {
                self.code.map(Cow::from)
            }
            fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
                self
            }
            fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
                self
            }
            fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
                self
            }
        }

        fn db_err(msg: &'static str, code: Option<&'static str>) -> sqlx::Error {
            sqlx::Error::from(MockDbError { msg, code })
        }

        #[test]
        fn connection_and_pool_errors_are_transient() {
            assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
            assert!(is_transient_error(&sqlx::Error::PoolClosed));
            assert!(is_transient_error(&sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }

        #[test]
        fn retriable_sqlstates_are_transient() {
            assert!(is_transient_error(&db_err("connection dropped", Some("08006"))));
            assert!(is_transient_error(&db_err(
                "canceling statement due to statement timeout",
                Some("57014"),
            )));
            assert!(is_transient_error(&db_err("deadlock detected", Some("40P01"))));
            assert!(is_transient_error(&db_err(
                "could not serialize access",
                Some("40001"),
            )));
        }

        #[test]
        fn constraint_and_syntax_errors_are_not_transient() {
            assert!(!is_transient_error(&db_err(
                "duplicate key value violates unique constraint",
                Some("23505"),
            )));
            assert!(!is_transient_error(&db_err("syntax error", Some("42601"))));
            assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        }
    }
}
