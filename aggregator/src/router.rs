use std::future::ready;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::metrics::{setup_metrics_recorder, track_metrics};
use crate::queue::EventQueue;
use crate::store::DedupStore;
use crate::{publish, query};

const BATCH_BODY_SIZE: usize = 2 * 1024 * 1024; // 2MB

/// Application context threaded through every handler. Constructed once at
/// startup; there is no process-wide state besides the metrics recorder.
#[derive(Clone)]
pub struct AppState {
    pub store: DedupStore,
    pub queue: Arc<dyn EventQueue + Send + Sync>,
    pub started_at: Instant,
    pub worker_count: usize,
    pub workers_enabled: bool,
}

async fn index() -> &'static str {
    "aggregator"
}

pub fn router(
    store: DedupStore,
    queue: Arc<dyn EventQueue + Send + Sync>,
    worker_count: usize,
    workers_enabled: bool,
    metrics: bool,
) -> Router {
    let state = AppState {
        store,
        queue,
        started_at: Instant::now(),
        worker_count,
        workers_enabled,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/publish", post(publish::publish))
        .route(
            "/events",
            get(query::list_events).delete(query::clear_events),
        )
        .route("/stats", get(query::stats))
        .route("/queue/stats", get(query::queue_stats))
        .route("/health", get(query::health))
        .route("/metrics/reset", post(query::reset_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .layer(DefaultBodyLimit::max(BATCH_BODY_SIZE))
        .with_state(state);

    // The prometheus recorder is a process-wide install, which misbehaves
    // when the router is built repeatedly inside tests. Only wire it up when
    // the caller asks.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
