use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A user-activity event as submitted by a caller and carried over the
/// delivery channel. It has no identity of its own; the channel assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub user_id: String,
    pub event_type: String,
    pub payload: Map<String, JsonValue>,
}

impl ActivityEvent {
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Map<String, JsonValue>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Text of the simulated push notification for this event.
    pub fn notification_message(&self) -> String {
        format!(
            "Simulating push notification for user [{}] about event [{}]",
            self.user_id, self.event_type
        )
    }
}
