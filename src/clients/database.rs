use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::{sync::Mutex, time::timeout};
use tokio_postgres::{Client, NoTls, Row, error::SqlState};
use tracing::{debug, error, info, warn};

use crate::{
    clients::NotificationStore,
    error::StoreError,
    models::{notification::NotificationRecord, status::NotificationStatus},
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id BIGSERIAL PRIMARY KEY,
        delivery_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        event_timestamp TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_notifications_delivery_id UNIQUE (delivery_id)
    )
"#;

/// PostgreSQL-backed notification store.
///
/// The connection is opened on first use and shared by every invocation in
/// the process. Opening happens under the lock, so concurrent first callers
/// wait for one connection instead of racing to open several.
pub struct DatabaseClient {
    database_url: String,
    timeout: Duration,
    client: Mutex<Option<Arc<Client>>>,
}

impl DatabaseClient {
    pub fn new(database_url: &str, timeout: Duration) -> Self {
        Self {
            database_url: database_url.to_string(),
            timeout,
            client: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Client>, StoreError> {
        let mut cached = self.client.lock().await;

        if let Some(client) = cached.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            warn!("Cached PostgreSQL connection is closed, reconnecting");
        }

        let client = Arc::new(self.connect().await?);
        *cached = Some(Arc::clone(&client));

        Ok(client)
    }

    async fn connect(&self) -> Result<Client, StoreError> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) =
            timeout(self.timeout, tokio_postgres::connect(&self.database_url, NoTls))
                .await
                .map_err(|_| StoreError::Connection(format!("timed out after {:?}", self.timeout)))?
                .map_err(|e| {
                    error!(error = %e, "Failed to connect to PostgreSQL");
                    StoreError::Connection(e.to_string())
                })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        timeout(self.timeout, client.batch_execute(SCHEMA))
            .await
            .map_err(|_| StoreError::Connection("schema bootstrap timed out".to_string()))?
            .map_err(|e| StoreError::Connection(format!("schema bootstrap failed: {}", e)))?;

        info!("PostgreSQL connection established");

        Ok(client)
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<Result<T, tokio_postgres::Error>, StoreError>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))
    }
}

#[async_trait]
impl NotificationStore for DatabaseClient {
    async fn find_by_delivery_id(
        &self,
        delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let client = self.connection().await?;

        let row = self
            .bounded(client.query_opt(
                r#"
                SELECT delivery_id, user_id, event_type, payload, event_timestamp,
                       status, message, processed_at
                FROM notifications
                WHERE delivery_id = $1
                "#,
                &[&delivery_id],
            ))
            .await??;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn insert(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        let client = self.connection().await?;

        let payload = JsonValue::Object(record.payload.clone());
        let status = record.status.to_string();

        let result = self
            .bounded(client.execute(
                r#"
                INSERT INTO notifications (
                    delivery_id,
                    user_id,
                    event_type,
                    payload,
                    event_timestamp,
                    status,
                    message,
                    processed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
                &[
                    &record.delivery_id,
                    &record.user_id,
                    &record.event_type,
                    &payload,
                    &record.event_timestamp,
                    &status,
                    &record.message,
                    &record.processed_at,
                ],
            ))
            .await?;

        match result {
            Ok(_) => {
                debug!(delivery_id = %record.delivery_id, "Notification written to database");
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(StoreError::DuplicateKey(record.delivery_id.clone()))
            }
            Err(e) => {
                error!(
                    error = %e,
                    delivery_id = %record.delivery_id,
                    "Failed to write notification to database"
                );
                Err(e.into())
            }
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let client = self.connection().await?;
        self.bounded(client.simple_query("SELECT 1")).await??;

        Ok(())
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            info!("PostgreSQL connection closed");
        }
    }
}

fn record_from_row(row: &Row) -> Result<NotificationRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let payload: JsonValue = row.try_get("payload")?;

    Ok(NotificationRecord {
        delivery_id: row.try_get("delivery_id")?,
        user_id: row.try_get("user_id")?,
        event_type: row.try_get("event_type")?,
        payload: payload.as_object().cloned().unwrap_or_default(),
        event_timestamp: row.try_get("event_timestamp")?,
        status: NotificationStatus::from_db(&status)
            .ok_or_else(|| StoreError::Query(format!("unknown status '{}'", status)))?,
        message: row.try_get("message")?,
        processed_at: row.try_get("processed_at")?,
    })
}
