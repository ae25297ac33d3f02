use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    clients::NotificationStore,
    config::{Config, LogFormat},
    error::{DecodeError, ProcessingError, StoreError},
    models::{
        event::ActivityEvent, notification::NotificationRecord, status::ProcessingOutcome,
        validation::validate_event,
    },
};

/// Decodes the JSON bytes of a delivery into an event, applying the same
/// shape rules as the ingress endpoint.
pub fn decode_event(data: &[u8]) -> Result<ActivityEvent, DecodeError> {
    let body: JsonValue = serde_json::from_slice(data)?;

    Ok(validate_event(&body)?)
}

/// Handles one delivery attempt.
///
/// A delivery id that already has a record completes as
/// [`ProcessingOutcome::AlreadyProcessed`] without writing. Every error is
/// returned to the caller, which must hand it back to the channel so the
/// delivery is retried or dead-lettered.
pub async fn process_delivery(
    data: &[u8],
    delivery_id: &str,
    store: &dyn NotificationStore,
) -> Result<ProcessingOutcome, ProcessingError> {
    info!(delivery_id, "Processing event");

    if delivery_id.is_empty() {
        return Err(DecodeError::MissingDeliveryId.into());
    }

    let event = decode_event(data).inspect_err(|e| {
        warn!(delivery_id, error = %e, "Failed to decode delivery");
    })?;

    if store.find_by_delivery_id(delivery_id).await?.is_some() {
        info!(delivery_id, "Event already processed, skipping");
        return Ok(ProcessingOutcome::AlreadyProcessed);
    }

    let message = event.notification_message();
    info!(
        delivery_id,
        user_id = %event.user_id,
        event_type = %event.event_type,
        "{}",
        message
    );

    let record = NotificationRecord::processed(delivery_id, event, message, Utc::now());

    match store.insert(&record).await {
        Ok(()) => {
            info!(delivery_id, "Successfully saved notification record");
            Ok(ProcessingOutcome::Processed(record))
        }
        Err(StoreError::DuplicateKey(_)) => {
            info!(
                delivery_id,
                "Concurrent delivery stored the record first, skipping"
            );
            Ok(ProcessingOutcome::AlreadyProcessed)
        }
        Err(e) => {
            warn!(delivery_id, error = %e, "Failed to persist notification record");
            Err(e.into())
        }
    }
}

pub fn init_tracing(config: &Config) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    result.map_err(|e| anyhow!("Failed to initialise tracing: {}", e))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
