use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiError;

/// Maximum length of the `topic`, `event_id` and `source` fields.
pub const MAX_FIELD_LENGTH: usize = 255;

/// An externally produced record submitted for aggregation.
///
/// Parsing is total: a request either deserializes into well-typed events or
/// is rejected at the boundary. `payload` is treated as an opaque blob and may
/// be any JSON value.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Value,
}

impl Event {
    /// Check the constraints deserialization alone cannot express: required
    /// strings are non-empty and within the column limits.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.topic.is_empty() {
            return Err(ApiError::InvalidEvent(
                "event submitted with an empty topic".to_owned(),
            ));
        }
        if self.topic.len() > MAX_FIELD_LENGTH {
            return Err(ApiError::InvalidEvent(format!(
                "topic exceeds {} characters",
                MAX_FIELD_LENGTH
            )));
        }
        if self.event_id.is_empty() {
            return Err(ApiError::InvalidEvent(
                "event submitted with an empty event_id".to_owned(),
            ));
        }
        if self.event_id.len() > MAX_FIELD_LENGTH {
            return Err(ApiError::InvalidEvent(format!(
                "event_id exceeds {} characters",
                MAX_FIELD_LENGTH
            )));
        }
        if self.source.is_empty() {
            return Err(ApiError::InvalidEvent(
                "event submitted with an empty source".to_owned(),
            ));
        }
        if self.source.len() > MAX_FIELD_LENGTH {
            return Err(ApiError::InvalidEvent(format!(
                "source exceeds {} characters",
                MAX_FIELD_LENGTH
            )));
        }
        Ok(())
    }

    /// The deduplication identity of this event.
    pub fn key(&self) -> (&str, &str) {
        (&self.topic, &self.event_id)
    }
}

/// An event as recorded by the dedup store.
///
/// `id` is the insert sequence assigned on first successful insert and breaks
/// ordering ties; `processed_at` is set by the store at insert and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Value,
    pub processed_at: DateTime<Utc>,
}
