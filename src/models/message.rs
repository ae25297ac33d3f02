use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Body of a Pub/Sub push-subscription request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,

    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64 of the published bytes. Absent when the publisher sent an
    /// empty message.
    #[serde(default)]
    pub data: Option<String>,

    #[serde(default)]
    pub message_id: Option<String>,

    /// Pub/Sub sends the id under both spellings.
    #[serde(default, rename = "message_id")]
    pub message_id_legacy: Option<String>,

    #[serde(default)]
    pub publish_time: Option<String>,

    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl PushMessage {
    pub fn delivery_id(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .or(self.message_id_legacy.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Body of `POST /v1/projects/{project}/topics/{topic}:publish`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub messages: Vec<PublishMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMessage {
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    #[serde(default)]
    pub message_ids: Vec<String>,
}

/// A delivery that could never be processed, parked on the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub delivery_id: Option<String>,
    /// Base64 of the original body, which may not be valid UTF-8.
    pub raw_data: String,
    pub failure_reason: String,
    pub attempts: u32,
    pub failed_at: String,
}
