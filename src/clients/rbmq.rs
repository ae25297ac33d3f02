use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{EventPublisher, NotificationStore},
    config::Config,
    error::{DecodeError, ProcessingError, PublishError},
    models::{message::DlqMessage, status::ProcessingOutcome},
    utils::process_delivery,
};

/// RabbitMQ binding of the delivery channel. The topic is a durable queue of
/// the same name. Undecodable deliveries, and deliveries that keep failing
/// after `MAX_DELIVERY_ATTEMPTS`, are parked on `{topic}.dlq`.
pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    queue_name: String,
    failed_queue_name: String,
    prefetch_count: u16,
    max_delivery_attempts: u32,
}

const ATTEMPT_HEADER: &str = "x-attempt";

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        let client = Self {
            connection,
            channel,
            queue_name: config.pubsub_topic_id.clone(),
            failed_queue_name: config.dead_letter_queue_name(),
            prefetch_count: config.prefetch_count,
            max_delivery_attempts: config.max_delivery_attempts,
        };

        client.declare_queue(&client.queue_name).await?;
        client.declare_queue(&client.failed_queue_name).await?;

        info!(queue = %client.queue_name, "RabbitMQ channel ready");

        Ok(client)
    }

    async fn declare_queue(&self, name: &str) -> Result<(), Error> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", name, e))?;

        Ok(())
    }

    pub async fn create_consumer(&self) -> Result<Consumer, Error> {
        self.channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "activity_processor",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        info!(queue = %self.queue_name, "Consumer created for queue");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }

    pub async fn publish_to_dlq(&self, message: &DlqMessage) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;

        self.publish_confirmed(
            &self.failed_queue_name,
            &payload,
            BasicProperties::default()
                .with_content_type(ShortString::from("application/json"))
                .with_delivery_mode(2),
        )
        .await
    }

    /// Consumes the topic queue until the broker closes the consumer.
    /// At most `concurrency` deliveries are processed at once.
    pub async fn run_consumer(
        self: Arc<Self>,
        store: Arc<dyn NotificationStore>,
        concurrency: usize,
    ) -> Result<(), Error> {
        let mut consumer = self.create_consumer().await?;
        let permits = Arc::new(Semaphore::new(concurrency));

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(error = %e, "Consumer stream failed");
                    return Err(anyhow!("Consumer stream failed: {}", e));
                }
            };

            let permit = Arc::clone(&permits).acquire_owned().await?;
            let client = Arc::clone(&self);
            let store = Arc::clone(&store);

            tokio::spawn(async move {
                client.handle_delivery(delivery, store.as_ref()).await;
                drop(permit);
            });
        }

        warn!(queue = %self.queue_name, "Consumer stream ended");

        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery, store: &dyn NotificationStore) {
        let delivery_tag = delivery.delivery_tag;
        let attempt = delivery_attempt(&delivery.properties);
        let delivery_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .filter(|id| !id.is_empty());

        let result = match delivery_id.as_deref() {
            Some(id) => process_delivery(&delivery.data, id, store).await,
            None => Err(ProcessingError::Decode(DecodeError::MissingDeliveryId)),
        };

        let failure = result
            .as_ref()
            .err()
            .map(ToString::to_string)
            .unwrap_or_default();

        let settled = match settlement(&result, attempt, self.max_delivery_attempts) {
            Settlement::Ack => self.acknowledge(delivery_tag).await,
            Settlement::Retry { next_attempt } => {
                warn!(
                    delivery_id = delivery_id.as_deref().unwrap_or_default(),
                    attempt,
                    max_attempts = self.max_delivery_attempts,
                    error = %failure,
                    "Processing failed, scheduling another attempt"
                );
                self.retry(&delivery, next_attempt).await
            }
            Settlement::DeadLetter => {
                warn!(
                    delivery_id = delivery_id.as_deref().unwrap_or_default(),
                    attempt,
                    error = %failure,
                    "Delivery cannot be processed, dead-lettering"
                );
                self.dead_letter(delivery_tag, delivery_id, &delivery.data, failure, attempt)
                    .await
            }
        };

        if let Err(e) = settled {
            error!(delivery_tag, error = %e, "Failed to settle delivery");
        }
    }

    /// Puts the delivery back on the topic queue with its attempt counter
    /// bumped, then acks the current copy. Falls back to a plain requeue
    /// when the republish is not confirmed.
    async fn retry(&self, delivery: &Delivery, next_attempt: u32) -> Result<(), Error> {
        let mut headers = delivery.properties.headers().clone().unwrap_or_default();
        headers.insert(
            ShortString::from(ATTEMPT_HEADER),
            AMQPValue::LongUInt(next_attempt),
        );
        let properties = delivery.properties.clone().with_headers(headers);

        match self.publish_confirmed(&self.queue_name, &delivery.data, properties).await {
            Ok(()) => self.acknowledge(delivery.delivery_tag).await,
            Err(e) => {
                warn!(error = %e, "Retry publish failed, requeueing delivery");
                self.reject(delivery.delivery_tag, true).await
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery_tag: u64,
        delivery_id: Option<String>,
        data: &[u8],
        failure_reason: String,
        attempts: u32,
    ) -> Result<(), Error> {
        let message = DlqMessage {
            delivery_id,
            raw_data: STANDARD.encode(data),
            failure_reason,
            attempts,
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        match self.publish_to_dlq(&message).await {
            Ok(()) => self.acknowledge(delivery_tag).await,
            Err(e) => {
                warn!(error = %e, "Dead-letter publish failed, rejecting without requeue");
                self.reject(delivery_tag, false).await
            }
        }
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        data: &[u8],
        properties: BasicProperties,
    ) -> Result<(), Error> {
        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), data, properties)
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", queue, e))?
            .await
            .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", queue, e))?;

        if confirmation.is_nack() {
            return Err(anyhow!("Broker nacked publish to {}", queue));
        }

        Ok(())
    }

    pub async fn close(&self) {
        match self
            .connection
            .close(200, "activity processor shutting down".into())
            .await
        {
            Ok(()) => info!("RabbitMQ connection closed"),
            Err(e) => warn!(error = %e, "Failed to close RabbitMQ connection"),
        }
    }
}

/// How a finished delivery attempt is settled with the broker.
#[derive(Debug, PartialEq, Eq)]
enum Settlement {
    Ack,
    Retry { next_attempt: u32 },
    DeadLetter,
}

fn settlement(
    result: &Result<ProcessingOutcome, ProcessingError>,
    attempt: u32,
    max_attempts: u32,
) -> Settlement {
    match result {
        Ok(_) => Settlement::Ack,
        Err(e) if e.is_retryable() && attempt < max_attempts => Settlement::Retry {
            next_attempt: attempt + 1,
        },
        Err(_) => Settlement::DeadLetter,
    }
}

/// 1-based attempt number carried in the `x-attempt` header.
fn delivery_attempt(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == ATTEMPT_HEADER)
                .map(|(_, value)| value)
        })
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            _ => None,
        })
        .unwrap_or(1)
        .max(1)
}

#[async_trait]
impl EventPublisher for RabbitMqClient {
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PublishError> {
        if topic != self.queue_name {
            self.declare_queue(topic)
                .await
                .map_err(|e| PublishError::Broker(e.to_string()))?;
        }

        let message_id = Uuid::new_v4().to_string();

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(message_id.clone()))
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2);

        self.publish_confirmed(topic, data, properties)
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        info!(message_id = %message_id, topic, "Message published to queue");

        Ok(message_id)
    }

    async fn health_check(&self) -> Result<(), PublishError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(PublishError::Broker("connection is not open".to_string()))
        }
    }
}
