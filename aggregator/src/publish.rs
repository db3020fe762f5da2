use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::ApiError;
use crate::event::Event;
use crate::queue::EventQueue;
use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PublishQuery {
    /// Apply the batch to the store in one transaction instead of queueing.
    #[serde(default)]
    pub atomic: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PublishRequest {
    pub events: Vec<Event>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PublishResponse {
    pub accepted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<i64>,
}

/// Accept a batch of events.
///
/// Validation is all-or-nothing: any invalid event rejects the whole batch
/// with 422 before any state is touched. `received` is incremented before the
/// enqueue/apply step, so a request cancelled midway can only ever leave
/// `received` over-counted, never behind `unique_processed +
/// duplicate_dropped`.
#[instrument(skip_all, fields(batch_size, atomic))]
pub async fn publish(
    state: State<AppState>,
    query: Query<PublishQuery>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Json<PublishResponse>, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::RequestDecodingError(rejection.body_text()))?;

    tracing::Span::current().record("batch_size", request.events.len());
    tracing::Span::current().record("atomic", query.atomic);

    if request.events.is_empty() {
        return Err(ApiError::EmptyBatch);
    }
    for event in &request.events {
        event.validate()?;
    }

    let accepted = request.events.len();
    state.store.increment_received(accepted as i64).await?;
    metrics::counter!("aggregator_events_received_total").increment(accepted as u64);

    if query.atomic {
        let outcome = state.store.apply_batch(&request.events).await?;
        tracing::debug!(
            accepted,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "applied atomic batch"
        );

        Ok(Json(PublishResponse {
            accepted,
            queued: None,
            inserted: Some(outcome.inserted),
            duplicate: Some(outcome.duplicates),
        }))
    } else {
        for event in &request.events {
            state.queue.enqueue(event).await?;
        }
        tracing::debug!(accepted, "queued batch");

        Ok(Json(PublishResponse {
            accepted,
            queued: Some(accepted),
            inserted: None,
            duplicate: None,
        }))
    }
}
