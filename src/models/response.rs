use serde::Serialize;

pub const ACCEPTED_MESSAGE: &str = "Event received and queued for processing.";
pub const PUBLISH_FAILED_MESSAGE: &str = "Internal Server Error. Could not publish event.";

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub message: &'static str,
}

impl AcceptedResponse {
    pub fn queued() -> Self {
        Self {
            status: "accepted",
            message: ACCEPTED_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

impl LivenessResponse {
    pub fn up() -> Self {
        Self { status: "UP" }
    }
}
