use std::{future::Future, sync::Arc};

use anyhow::{Error, Result};
use axum::{
    Router,
    body::Bytes,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clients::{EventPublisher, NotificationStore, health::HealthChecker},
    error::{DecodeError, IngressError, ProcessingError, PublishError, ValidationError},
    models::{
        health::ReadinessReport,
        message::PushEnvelope,
        response::{AcceptedResponse, LivenessResponse},
        validation::validate_event,
    },
    utils::process_delivery,
};

pub struct PublisherState {
    pub publisher: Arc<dyn EventPublisher>,
    pub topic: String,
    pub health_checker: HealthChecker,
}

impl PublisherState {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>) -> Self {
        Self {
            health_checker: HealthChecker::new().with_publisher(Arc::clone(&publisher)),
            publisher,
            topic: topic.into(),
        }
    }
}

pub struct ProcessorState {
    pub store: Arc<dyn NotificationStore>,
    pub health_checker: HealthChecker,
}

impl ProcessorState {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            health_checker: HealthChecker::new().with_store(Arc::clone(&store)),
            store,
        }
    }

    /// Also reports the channel the processor consumes from in readiness.
    pub fn with_channel(mut self, channel: Arc<dyn EventPublisher>) -> Self {
        self.health_checker = self.health_checker.with_publisher(channel);
        self
    }
}

pub fn publisher_router(state: Arc<PublisherState>) -> Router {
    Router::new()
        .route("/events/activity", post(publish_activity))
        .route("/api/events/activity", post(publish_activity))
        .route("/health", get(liveness))
        .route("/health/ready", get(publisher_readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn processor_router(state: Arc<ProcessorState>) -> Router {
    Router::new()
        .route("/pubsub/push", post(receive_push))
        .route("/health", get(liveness))
        .route("/health/ready", get(processor_readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server<S>(router: Router, port: u16, shutdown: S) -> Result<(), Error>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "HTTP server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Parses the body regardless of its declared content type, so a client
/// that forgets the header still gets field-level validation messages.
async fn publish_activity(
    State(state): State<Arc<PublisherState>>,
    body: Bytes,
) -> Result<impl IntoResponse, IngressError> {
    let body: JsonValue = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Rejected unreadable event body");
        ValidationError::InvalidBody
    })?;

    let event = validate_event(&body).inspect_err(|e| {
        warn!(error = %e, "Rejected invalid event");
    })?;

    let data = serde_json::to_vec(&event).map_err(PublishError::from)?;

    let message_id = state.publisher.publish(&state.topic, &data).await?;

    info!(
        message_id = %message_id,
        topic = %state.topic,
        user_id = %event.user_id,
        event_type = %event.event_type,
        "Event accepted"
    );

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::queued())))
}

/// Pub/Sub push subscription endpoint. Any non-2xx reply makes Pub/Sub
/// redeliver the message later or dead-letter it.
async fn receive_push(
    State(state): State<Arc<ProcessorState>>,
    body: Result<Json<PushEnvelope>, JsonRejection>,
) -> Result<StatusCode, ProcessingError> {
    let Json(envelope) = body.map_err(|e| {
        warn!(error = %e, "Rejected malformed push request");
        DecodeError::Envelope(e.body_text())
    })?;

    let delivery_id = envelope
        .message
        .delivery_id()
        .ok_or(DecodeError::MissingDeliveryId)?;

    let data = match envelope.message.data.as_deref() {
        Some(encoded) => STANDARD.decode(encoded).map_err(DecodeError::from)?,
        None => b"{}".to_vec(),
    };

    let outcome = process_delivery(&data, delivery_id, state.store.as_ref())
        .await
        .inspect_err(|e| warn!(delivery_id, error = %e, "Push delivery failed"))?;

    if outcome.is_skip() {
        info!(delivery_id, "Push delivery acknowledged as duplicate");
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(LivenessResponse::up()))
}

async fn publisher_readiness(
    State(state): State<Arc<PublisherState>>,
) -> (StatusCode, Json<ReadinessReport>) {
    readiness(&state.health_checker).await
}

async fn processor_readiness(
    State(state): State<Arc<ProcessorState>>,
) -> (StatusCode, Json<ReadinessReport>) {
    readiness(&state.health_checker).await
}

async fn readiness(health_checker: &HealthChecker) -> (StatusCode, Json<ReadinessReport>) {
    let report = health_checker.check_all().await;

    let status_code = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(report))
}
