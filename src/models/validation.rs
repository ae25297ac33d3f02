use serde_json::Value as JsonValue;

use crate::{error::ValidationError, models::event::ActivityEvent};

/// Checks the shape of an untyped event body and extracts the typed event.
///
/// Fields are checked in order `userId`, `eventType`, `payload`, so the first
/// offending field is the one reported.
pub fn validate_event(body: &JsonValue) -> Result<ActivityEvent, ValidationError> {
    let user_id = body
        .get("userId")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::InvalidUserId)?;

    let event_type = body
        .get("eventType")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::InvalidEventType)?;

    let payload = body
        .get("payload")
        .and_then(JsonValue::as_object)
        .ok_or(ValidationError::InvalidPayload)?;

    Ok(ActivityEvent::new(user_id, event_type, payload.clone()))
}
