use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::models::{event::ActivityEvent, status::NotificationStatus};

/// Persisted outcome of one delivery. Created once per `delivery_id`, never
/// updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub delivery_id: String,
    pub user_id: String,
    pub event_type: String,
    pub payload: Map<String, JsonValue>,
    pub event_timestamp: DateTime<Utc>,
    pub status: NotificationStatus,
    pub message: String,
    pub processed_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn processed(
        delivery_id: &str,
        event: ActivityEvent,
        message: String,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let event_timestamp = event_timestamp(&event.payload).unwrap_or(processed_at);

        Self {
            delivery_id: delivery_id.to_string(),
            user_id: event.user_id,
            event_type: event.event_type,
            payload: event.payload,
            event_timestamp,
            status: NotificationStatus::Processed,
            message,
            processed_at,
        }
    }
}

/// Reads `payload.timestamp` as either an RFC 3339 string or epoch
/// milliseconds.
pub fn event_timestamp(payload: &Map<String, JsonValue>) -> Option<DateTime<Utc>> {
    match payload.get("timestamp")? {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
