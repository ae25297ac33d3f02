use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::error;

use crate::models::response::{ErrorResponse, PUBLISH_FAILED_MESSAGE};

/// A candidate event with the wrong shape. Client-caused, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid or missing userId. Must be a string.")]
    InvalidUserId,

    #[error("Invalid or missing eventType. Must be a string.")]
    InvalidEventType,

    #[error("Invalid or missing payload. Must be an object.")]
    InvalidPayload,

    #[error("Invalid JSON body.")]
    InvalidBody,
}

/// Submission to the delivery channel failed.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Channel request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Channel rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Channel authentication failed: {0}")]
    Auth(String),

    #[error("Channel did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A delivery whose bytes do not carry a usable event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Delivery data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Delivery data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Delivery data is not a valid event: {0}")]
    InvalidEvent(#[from] ValidationError),

    #[error("Push request body is malformed: {0}")]
    Envelope(String),

    #[error("Delivery has no delivery id")]
    MissingDeliveryId,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to connect to notification store: {0}")]
    Connection(String),

    #[error("Notification for delivery {0} already exists")]
    DuplicateKey(String),

    #[error("Notification store did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Notification store query failed: {0}")]
    Query(String),

    /// The store refused the record's contents. Writing the same record
    /// again fails the same way.
    #[error("Notification store rejected the record: {0}")]
    InvalidData(String),

    #[error("Stored notification is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported store URL scheme: {0}")]
    UnsupportedUrl(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.is_closed() {
            return StoreError::Connection(e.to_string());
        }

        match e.as_db_error() {
            // Class 22: data exception, e.g. a NUL byte in a text column.
            Some(db) if db.code().code().starts_with("22") => {
                StoreError::InvalidData(format!("{} ({})", db.message(), db.code().code()))
            }
            Some(db) => StoreError::Query(format!("{} ({})", db.message(), db.code().code())),
            None => StoreError::Query(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Query(e.to_string())
        }
    }
}

/// Failure of the ingress endpoint.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Failure of one consumer invocation. Every variant tells the channel to
/// redeliver or dead-letter; the consumer never retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Notification store unavailable: {0}")]
    StoreConnection(String),

    #[error("Notification cannot be stored: {0}")]
    InvalidRecord(String),

    #[error("Failed to persist notification: {0}")]
    Unexpected(String),
}

impl From<StoreError> for ProcessingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Connection(msg) => ProcessingError::StoreConnection(msg),
            StoreError::Timeout(after) => {
                ProcessingError::StoreConnection(format!("timed out after {:?}", after))
            }
            StoreError::InvalidData(msg) => ProcessingError::InvalidRecord(msg),
            other => ProcessingError::Unexpected(other.to_string()),
        }
    }
}

impl ProcessingError {
    /// Whether redelivering the same bytes could ever succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProcessingError::Decode(_) | ProcessingError::InvalidRecord(_)
        )
    }
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(self.to_string())),
        )
            .into_response()
    }
}

impl IntoResponse for PublishError {
    fn into_response(self) -> Response {
        error!(error = %self, "Failed to publish event");

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(PUBLISH_FAILED_MESSAGE)),
        )
            .into_response()
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        match self {
            IngressError::Validation(e) => e.into_response(),
            IngressError::Publish(e) => e.into_response(),
        }
    }
}

impl IntoResponse for ProcessingError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProcessingError::Decode(_) => StatusCode::BAD_REQUEST,
            ProcessingError::InvalidRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProcessingError::StoreConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProcessingError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}
