use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisResult, aio::MultiplexedConnection};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info};

use crate::{
    clients::NotificationStore, error::StoreError, models::notification::NotificationRecord,
};

/// Redis-backed notification store.
///
/// Redis has no unique index, so `SET key value NX` is the insert-if-absent
/// primitive: exactly one of several racing writers gets `OK`.
pub struct RedisClient {
    client: Client,
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisClient {
    pub fn new(redis_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Connection(format!("Invalid redis URL: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut cached = self.connection.lock().await;

        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }

        info!("Connecting to Redis");

        let connection = timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Connection(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Redis connection established");

        *cached = Some(connection.clone());

        Ok(connection)
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let result = timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?;

        if let Err(e) = &result {
            if e.is_connection_dropped() || e.is_io_error() {
                // Forget the dead connection so the next invocation reconnects.
                self.connection.lock().await.take();
            }
        }

        Ok(result?)
    }
}

fn record_key(delivery_id: &str) -> String {
    format!("notification:{}", delivery_id)
}

#[async_trait]
impl NotificationStore for RedisClient {
    async fn find_by_delivery_id(
        &self,
        delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let key = record_key(delivery_id);

        let value: Option<String> = self.bounded(conn.get(&key)).await?;

        value
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn insert(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = record_key(&record.delivery_id);
        let json = serde_json::to_string(record)?;

        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&json)
                    .arg("NX")
                    .query_async(&mut conn),
            )
            .await?;

        match reply {
            Some(_) => {
                debug!(delivery_id = %record.delivery_id, "Notification written to Redis");
                Ok(())
            }
            None => Err(StoreError::DuplicateKey(record.delivery_id.clone())),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;

        Ok(())
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Redis connection closed");
        }
    }
}
