//! # Worker pool
//!
//! A fixed number of homogeneous tasks that drive events from the queue
//! through [`DedupStore::apply_event`]. Workers hold no shared mutable state;
//! the store's unique constraint is the only serialization point, so any
//! interleaving of any number of workers yields the same final row set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::event::Event;
use crate::queue::EventQueue;
use crate::retry::RetryPolicy;
use crate::store::{DedupStore, InsertOutcome};

/// How long a worker sleeps after a failed dequeue before polling again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    store: DedupStore,
    queue: Arc<dyn EventQueue + Send + Sync>,
    worker_count: usize,
    dequeue_timeout: Duration,
    retry_policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(
        store: DedupStore,
        queue: Arc<dyn EventQueue + Send + Sync>,
        worker_count: usize,
        dequeue_timeout: Duration,
        retry_policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queue,
            worker_count,
            dequeue_timeout,
            retry_policy,
            shutdown,
        }
    }

    /// Spawn all workers onto the runtime. Each task owns clones of the pool
    /// handles and exits once the shutdown signal flips, letting any
    /// in-flight apply finish first.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|id| {
                let store = self.store.clone();
                let queue = self.queue.clone();
                let dequeue_timeout = self.dequeue_timeout;
                let retry_policy = self.retry_policy;
                let shutdown = self.shutdown.clone();

                tokio::spawn(async move {
                    worker_loop(id, store, queue, dequeue_timeout, retry_policy, shutdown).await
                })
            })
            .collect()
    }
}

async fn worker_loop(
    id: usize,
    store: DedupStore,
    queue: Arc<dyn EventQueue + Send + Sync>,
    dequeue_timeout: Duration,
    retry_policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker = id, "worker started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            dequeued = queue.dequeue(dequeue_timeout) => {
                match dequeued {
                    Ok(Some(event)) => apply_with_retries(&store, &retry_policy, &event).await,
                    Ok(None) => {}
                    Err(error) => {
                        // Includes entries that fail to decode: those were
                        // validated at ingestion, so a parse failure means the
                        // backing table was corrupted or the schema drifted.
                        metrics::counter!("aggregator_queue_errors_total").increment(1);
                        tracing::error!(worker = id, "failed to dequeue event: {}", error);
                        tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    tracing::info!(worker = id, "worker stopped");
}

/// Apply one event, retrying transient store failures with bounded backoff.
/// Past the retry budget the event is dropped so it cannot block the queue
/// head; idempotency makes a later resubmission safe.
async fn apply_with_retries(store: &DedupStore, retry_policy: &RetryPolicy, event: &Event) {
    let mut attempt: u32 = 0;

    loop {
        match store.apply_event(event).await {
            Ok(InsertOutcome::Inserted) => {
                metrics::counter!("aggregator_events_inserted_total").increment(1);
                tracing::debug!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    "inserted event"
                );
                return;
            }
            Ok(InsertOutcome::Duplicate) => {
                metrics::counter!("aggregator_events_duplicate_total").increment(1);
                tracing::debug!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    "dropped duplicate event"
                );
                return;
            }
            Err(error) if error.is_transient() && attempt + 1 < retry_policy.max_attempts() => {
                let backoff = retry_policy.time_until_next_retry(attempt);
                attempt += 1;
                tracing::warn!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    attempt,
                    "transient store error: {}, retrying in {:?}",
                    error,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => {
                metrics::counter!("aggregator_events_dead_lettered_total").increment(1);
                tracing::error!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    "dropping event after {} attempts: {}",
                    attempt + 1,
                    error
                );
                // Slow the loop after a drop: a store that rejects events
                // outright must not let the pool burn through the queue.
                tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryEventQueue;
    use serde_json::json;
    use sqlx::PgPool;

    fn event(event_id: &str) -> Event {
        Event {
            topic: "worker-test".to_owned(),
            event_id: event_id.to_owned(),
            timestamp: "2024-12-12T10:00:00Z".parse().unwrap(),
            source: "test".to_owned(),
            payload: json!({}),
        }
    }

    async fn wait_until_quiescent(queue: &MemoryEventQueue, store: &DedupStore, submitted: i64) {
        for _ in 0..200 {
            let counters = store.counters().await.unwrap();
            let applied = counters.unique_processed + counters.duplicate_dropped;
            if queue.size().await.unwrap() == 0 && applied >= submitted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("workers did not drain the queue in time");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn workers_drain_the_queue_and_deduplicate(db: PgPool) {
        let store = DedupStore::new(db);
        let queue = Arc::new(MemoryEventQueue::new());

        queue.enqueue(&event("a")).await.unwrap();
        queue.enqueue(&event("a")).await.unwrap();
        queue.enqueue(&event("b")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::new(
            store.clone(),
            queue.clone(),
            3,
            Duration::from_millis(20),
            RetryPolicy::default(),
            shutdown_rx,
        );
        let handles = pool.spawn();

        wait_until_quiescent(&queue, &store, 3).await;

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.unique_processed, 2);
        assert_eq!(counters.duplicate_dropped, 1);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn workers_exit_on_shutdown_and_leave_the_queue_intact(db: PgPool) {
        let store = DedupStore::new(db);
        let queue = Arc::new(MemoryEventQueue::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::new(
            store.clone(),
            queue.clone(),
            2,
            Duration::from_millis(20),
            RetryPolicy::default(),
            shutdown_rx,
        );
        let handles = pool.spawn();

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        // Entries enqueued after shutdown stay for the next run.
        queue.enqueue(&event("late")).await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(store.counters().await.unwrap().unique_processed, 0);
    }
}
