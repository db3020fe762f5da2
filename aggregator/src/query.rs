//! Read-side endpoints: stored events, counters, queue depth, health, and
//! the counter-reset operational aid.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::event::StoredEvent;
use crate::queue::EventQueue;
use crate::router::AppState;

pub const DEFAULT_EVENTS_LIMIT: u32 = 100;
pub const MAX_EVENTS_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub topic: String,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Stored events of one topic, newest first. `limit` defaults to
/// [`DEFAULT_EVENTS_LIMIT`] and is capped at [`MAX_EVENTS_LIMIT`]; negative
/// values fail deserialization and surface as a validation error.
pub async fn list_events(
    state: State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let Query(query) =
        query.map_err(|rejection| ApiError::RequestDecodingError(rejection.body_text()))?;

    let limit = query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT).min(MAX_EVENTS_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let events = state
        .store
        .events_by_topic(&query.topic, i64::from(limit), i64::from(offset))
        .await?;

    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct ClearEventsQuery {
    pub topic: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearEventsResponse {
    pub deleted: u64,
    pub topic: String,
}

/// Destructive operational aid: drop stored events, for one topic or all.
pub async fn clear_events(
    state: State<AppState>,
    Query(query): Query<ClearEventsQuery>,
) -> Result<Json<ClearEventsResponse>, ApiError> {
    let deleted = state.store.delete_events(query.topic.as_deref()).await?;
    tracing::info!(deleted, topic = ?query.topic, "cleared stored events");

    Ok(Json(ClearEventsResponse {
        deleted,
        topic: query.topic.unwrap_or_else(|| "all".to_owned()),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub dedup_rate_percent: f64,
    pub topics: Vec<String>,
    pub uptime_seconds: f64,
}

pub async fn stats(state: State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counters = state.store.counters().await?;
    let topics = state.store.topics().await?;

    let dedup_rate_percent =
        counters.duplicate_dropped as f64 / std::cmp::max(counters.received, 1) as f64 * 100.0;

    Ok(Json(StatsResponse {
        received: counters.received,
        unique_processed: counters.unique_processed,
        duplicate_dropped: counters.duplicate_dropped,
        dedup_rate_percent,
        topics,
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queue_size: i64,
    pub queue_type: String,
    pub worker_count: usize,
    pub workers_enabled: bool,
}

pub async fn queue_stats(state: State<AppState>) -> Result<Json<QueueStatsResponse>, ApiError> {
    let queue_size = state.queue.size().await?;

    Ok(Json(QueueStatsResponse {
        queue_size,
        queue_type: state.queue.kind().to_owned(),
        worker_count: state.worker_count,
        workers_enabled: state.workers_enabled,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub queue: bool,
    pub uptime_seconds: f64,
}

/// Liveness probe: pings the store and the queue. 200 when both answer,
/// 503 `degraded` otherwise so the worker deployment stops receiving traffic
/// until the backing services recover.
pub async fn health(state: State<AppState>) -> Response {
    let database = state.store.ping().await.is_ok();
    let queue = state.queue.size().await.is_ok();
    let healthy = database && queue;

    if !healthy {
        tracing::warn!(database, queue, "health check failed");
    }

    let body = Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_owned(),
        database,
        queue,
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
    });

    match healthy {
        true => (StatusCode::OK, body),
        false => (StatusCode::SERVICE_UNAVAILABLE, body),
    }
    .into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: String,
}

/// Zero the counters. Stored events are untouched, so `unique_processed`
/// stays behind the row count until those are cleared too.
pub async fn reset_metrics(state: State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    state.store.reset_counters().await?;
    tracing::info!("reset aggregate counters");

    Ok(Json(ResetResponse {
        status: "reset".to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EventQueue, MemoryEventQueue};
    use crate::router::router;
    use crate::store::DedupStore;
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use sqlx::PgPool;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app(db: PgPool, queue: Arc<MemoryEventQueue>) -> axum::Router {
        router(DedupStore::new(db), queue, 4, true, false)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn event(topic: &str, event_id: &str, timestamp: &str) -> crate::event::Event {
        crate::event::Event {
            topic: topic.to_owned(),
            event_id: event_id.to_owned(),
            timestamp: timestamp.parse().unwrap(),
            source: "test".to_owned(),
            payload: json!({}),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn events_endpoint_returns_newest_first(db: PgPool) {
        let store = DedupStore::new(db.clone());
        store
            .apply_event(&event("demo-topic", "older", "2024-12-12T09:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("demo-topic", "newer", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app.oneshot(get("/events?topic=demo-topic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let rows: Vec<StoredEvent> = body_json(response).await;
        let ids: Vec<&str> = rows.iter().map(|row| row.event_id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn events_limit_zero_returns_empty(db: PgPool) {
        let store = DedupStore::new(db.clone());
        store
            .apply_event(&event("demo-topic", "one", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app
            .oneshot(get("/events?topic=demo-topic&limit=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let rows: Vec<StoredEvent> = body_json(response).await;
        assert!(rows.is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn events_negative_limit_is_rejected(db: PgPool) {
        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app
            .oneshot(get("/events?topic=demo-topic&limit=-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn events_missing_topic_is_rejected(db: PgPool) {
        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app.oneshot(get("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn stats_reports_counters_rate_and_topics(db: PgPool) {
        let store = DedupStore::new(db.clone());
        store.increment_received(3).await.unwrap();
        let e = event("demo-topic", "duplicate-test-001", "2024-12-12T10:00:00Z");
        store.apply_event(&e).await.unwrap();
        store.apply_event(&e).await.unwrap();
        store.apply_event(&e).await.unwrap();

        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app.oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats: StatsResponse = body_json(response).await;
        assert_eq!(stats.received, 3);
        assert_eq!(stats.unique_processed, 1);
        assert_eq!(stats.duplicate_dropped, 2);
        assert!((stats.dedup_rate_percent - 2.0 / 3.0 * 100.0).abs() < 1e-9);
        assert_eq!(stats.topics, vec!["demo-topic"]);
        assert!(stats.uptime_seconds >= 0.0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn queue_stats_reports_depth_and_configuration(db: PgPool) {
        let queue = Arc::new(MemoryEventQueue::new());
        queue
            .enqueue(&event("demo-topic", "queued", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        let app = test_app(db, queue);
        let response = app.oneshot(get("/queue/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats: QueueStatsResponse = body_json(response).await;
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.queue_type, "memory");
        assert_eq!(stats.worker_count, 4);
        assert!(stats.workers_enabled);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn health_is_healthy_with_reachable_backends(db: PgPool) {
        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "healthy");
        assert!(health.database);
        assert!(health.queue);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn reset_metrics_zeroes_counters(db: PgPool) {
        let store = DedupStore::new(db.clone());
        store.increment_received(5).await.unwrap();

        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/metrics/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let reset: ResetResponse = body_json(response).await;
        assert_eq!(reset.status, "reset");
        assert_eq!(store.counters().await.unwrap().received, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn clear_events_deletes_stored_rows(db: PgPool) {
        let store = DedupStore::new(db.clone());
        store
            .apply_event(&event("demo-topic", "one", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();
        store
            .apply_event(&event("other-topic", "two", "2024-12-12T10:00:00Z"))
            .await
            .unwrap();

        let app = test_app(db, Arc::new(MemoryEventQueue::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::DELETE)
                    .uri("/events?topic=demo-topic")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cleared: ClearEventsResponse = body_json(response).await;
        assert_eq!(cleared.deleted, 1);
        assert_eq!(cleared.topic, "demo-topic");
        assert_eq!(store.topics().await.unwrap(), vec!["other-topic"]);
    }
}
