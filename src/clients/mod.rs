use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::{ChannelBackend, Config},
    error::{PublishError, StoreError},
    models::notification::NotificationRecord,
};

pub mod database;
pub mod health;
pub mod memory;
pub mod pubsub;
pub mod rbmq;
pub mod redis;

/// Publishing side of the delivery channel.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Submits `data` under `topic` and returns the channel-assigned
    /// delivery id.
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PublishError>;

    async fn health_check(&self) -> Result<(), PublishError>;
}

/// Durable store of notification records keyed by delivery id.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn find_by_delivery_id(
        &self,
        delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    /// Inserts the record unless one with the same delivery id exists, as a
    /// single atomic step. An existing record yields
    /// [`StoreError::DuplicateKey`].
    async fn insert(&self, record: &NotificationRecord) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Drops the cached connection, if any.
    async fn close(&self) {}
}

/// Picks the store backend from the scheme of `DATABASE_URL`. No connection
/// is opened until the first operation.
pub fn open_store(config: &Config) -> Result<Arc<dyn NotificationStore>, StoreError> {
    let url = config.database_url.as_str();
    let scheme = url.split("://").next().unwrap_or_default();

    match scheme {
        "postgres" | "postgresql" => Ok(Arc::new(database::DatabaseClient::new(
            url,
            config.store_timeout(),
        ))),
        "redis" | "rediss" => Ok(Arc::new(redis::RedisClient::new(
            url,
            config.store_timeout(),
        )?)),
        "memory" => Ok(Arc::new(memory::InMemoryStore::default())),
        other => Err(StoreError::UnsupportedUrl(other.to_string())),
    }
}

/// Builds the publisher for the configured channel backend.
pub async fn open_publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    match config.channel_backend {
        ChannelBackend::PubSub => Ok(Arc::new(pubsub::PubSubClient::from_config(config)?)),
        ChannelBackend::RabbitMq => Ok(Arc::new(rbmq::RabbitMqClient::connect(config).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_url(url: &str) -> Config {
        Config::from_vars(vec![("DATABASE_URL".to_string(), url.to_string())]).unwrap()
    }

    #[test]
    fn store_backend_follows_url_scheme() {
        assert!(open_store(&config_with_url("memory://")).is_ok());
        assert!(open_store(&config_with_url("postgres://localhost/db")).is_ok());
        assert!(open_store(&config_with_url("redis://localhost:6379")).is_ok());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let result = open_store(&config_with_url("mongodb://localhost:27017/notifications"));
        assert!(matches!(result, Err(StoreError::UnsupportedUrl(s)) if s == "mongodb"));
    }
}
