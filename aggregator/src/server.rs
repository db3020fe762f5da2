use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Config;
use crate::queue::{EventQueue, MemoryEventQueue, PgEventQueue};
use crate::retry::RetryPolicy;
use crate::router;
use crate::store::DedupStore;
use crate::worker::WorkerPool;

/// Build a pool with fail-fast acquisition and a session statement timeout,
/// so no store call can wait unboundedly.
pub async fn get_pool(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .test_before_acquire(true)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET statement_timeout = '5s'")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

/// Wire the store, queue, worker pool and router together and serve until
/// `shutdown` resolves. Workers are signalled after the HTTP server has
/// drained, and any in-flight apply completes before the process returns.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store_pool = get_pool(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the event store database");
    sqlx::migrate!("../migrations")
        .run(&store_pool)
        .await
        .expect("failed to run database migrations");
    let store = DedupStore::new(store_pool.clone());

    let queue: Arc<dyn EventQueue + Send + Sync> = if config.use_inmemory_queue {
        tracing::warn!("using the non-durable in-memory queue");
        Arc::new(MemoryEventQueue::new())
    } else if config.queue_url() == config.database_url {
        Arc::new(PgEventQueue::new(
            config.queue_key.clone(),
            store_pool,
            config.worker_poll_interval(),
        ))
    } else {
        let queue_pool = get_pool(config.queue_url(), config.max_pg_connections)
            .await
            .expect("failed to connect to the queue database");
        sqlx::migrate!("../migrations")
            .run(&queue_pool)
            .await
            .expect("failed to run queue database migrations");
        Arc::new(PgEventQueue::new(
            config.queue_key.clone(),
            queue_pool,
            config.worker_poll_interval(),
        ))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_count = config.worker_count.max(1);
    let workers_enabled = !config.disable_workers;

    let mut worker_handles = Vec::new();
    if workers_enabled {
        let pool = WorkerPool::new(
            store.clone(),
            queue.clone(),
            worker_count,
            config.worker_dequeue_timeout(),
            RetryPolicy::default(),
            shutdown_rx,
        );
        worker_handles = pool.spawn();
        tracing::info!(worker_count, "started workers");
    } else {
        tracing::info!("workers disabled");
    }

    let app = router::router(
        store,
        queue,
        worker_count,
        workers_enabled,
        config.export_prometheus,
    );

    tracing::info!(
        "listening on {:?}",
        listener.local_addr().expect("listener has no local address")
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("aggregator shut down");
}
