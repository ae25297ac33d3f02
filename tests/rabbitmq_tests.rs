use std::{sync::Arc, time::Duration};

use activity_pipeline::{
    clients::{EventPublisher, NotificationStore, memory::InMemoryStore, rbmq::RabbitMqClient},
    config::Config,
    models::message::DlqMessage,
};
use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{BasicGetOptions, BasicPublishOptions, QueueDeclareOptions},
    types::{FieldTable, ShortString},
};
use serde_json::json;
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep},
};
use uuid::Uuid;

use crate::{
    common::BrokenWriteStore,
    containers::{self, eventually},
};

struct Harness {
    topic: String,
    client: Arc<RabbitMqClient>,
    consumer: JoinHandle<anyhow::Result<()>>,
    /// Separate connection used by the test to publish and inspect queues.
    channel: Channel,
    _connection: Connection,
}

impl Harness {
    async fn start(url: &str, store: Arc<dyn NotificationStore>) -> Result<Self> {
        let topic = format!("activity-{}", Uuid::new_v4());
        let config = Config::from_vars(vec![
            ("RABBITMQ_URL".to_string(), url.to_string()),
            ("PUBSUB_TOPIC_ID".to_string(), topic.clone()),
            ("CHANNEL_BACKEND".to_string(), "rabbitmq".to_string()),
            ("MAX_DELIVERY_ATTEMPTS".to_string(), "3".to_string()),
        ])?;

        let client = Arc::new(RabbitMqClient::connect(&config).await?);
        let consumer = tokio::spawn(Arc::clone(&client).run_consumer(store, 4));

        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        Ok(Self {
            topic,
            client,
            consumer,
            channel,
            _connection: connection,
        })
    }

    fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.topic)
    }

    async fn send(&self, message_id: &str, data: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.topic,
                BasicPublishOptions::default(),
                data,
                BasicProperties::default()
                    .with_message_id(ShortString::from(message_id))
                    .with_delivery_mode(2),
            )
            .await?
            .await?;

        Ok(())
    }

    async fn ready_messages(&self, queue: &str) -> Result<u32> {
        let queue = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.message_count())
    }

    async fn next_dead_letter(&self) -> Result<DlqMessage> {
        let queue = self.dead_letter_queue();
        let deadline = Instant::now() + Duration::from_secs(30);

        while Instant::now() < deadline {
            let message = self
                .channel
                .basic_get(&queue, BasicGetOptions { no_ack: true })
                .await?;

            if let Some(message) = message {
                return Ok(serde_json::from_slice(&message.delivery.data)?);
            }
            sleep(Duration::from_millis(200)).await;
        }

        Err(anyhow!("nothing arrived on {}", queue))
    }

    /// Stops consuming and closes the processor's connection, which returns
    /// any unacknowledged delivery to its queue.
    async fn stop(self) -> Result<Self> {
        self.consumer.abort();
        self.client.close().await;
        sleep(Duration::from_millis(500)).await;

        Ok(self)
    }
}

fn event_bytes() -> Vec<u8> {
    json!({ "userId": "user_123", "eventType": "click", "payload": { "page": "home" } })
        .to_string()
        .into_bytes()
}

/// Test: An undecodable delivery is parked on the dead-letter queue
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a Docker daemon"]
async fn test_undecodable_delivery_is_dead_lettered() -> Result<()> {
    let (_container, url) = containers::rabbitmq().await?;
    let store = Arc::new(InMemoryStore::default());
    let harness = Harness::start(&url, store.clone()).await?;

    harness.send("bad-1", b"not json at all").await?;

    let parked = harness.next_dead_letter().await?;

    assert_eq!(parked.delivery_id.as_deref(), Some("bad-1"));
    assert_eq!(STANDARD.decode(&parked.raw_data)?, b"not json at all");
    assert_eq!(parked.attempts, 1);
    assert!(store.is_empty().await);

    Ok(())
}

/// Test: A delivery that keeps failing stops after the attempt cap
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a Docker daemon"]
async fn test_persistent_failure_is_dead_lettered_after_attempt_cap() -> Result<()> {
    let (_container, url) = containers::rabbitmq().await?;
    let harness = Harness::start(&url, Arc::new(BrokenWriteStore)).await?;

    harness.send("stuck-1", &event_bytes()).await?;

    let parked = harness.next_dead_letter().await?;

    assert_eq!(parked.delivery_id.as_deref(), Some("stuck-1"));
    assert_eq!(parked.attempts, 3);
    assert!(parked.failure_reason.contains("disk full"), "{}", parked.failure_reason);

    let harness = harness.stop().await?;
    assert_eq!(harness.ready_messages(&harness.topic).await?, 0);

    Ok(())
}

/// Test: A redelivered message is stored once and both copies are acked
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a Docker daemon"]
async fn test_redelivery_is_acked_once_stored() -> Result<()> {
    let (_container, url) = containers::rabbitmq().await?;
    let store = Arc::new(InMemoryStore::default());
    let harness = Harness::start(&url, store.clone()).await?;

    harness.send("dup-1", &event_bytes()).await?;
    harness.send("dup-1", &event_bytes()).await?;

    let probe = Arc::clone(&store);
    eventually("the record to be stored", move || {
        let store = Arc::clone(&probe);
        async move { store.find_by_delivery_id("dup-1").await.ok().flatten().is_some() }
    })
    .await?;

    let queues = &harness;
    eventually("both copies to be taken off the queue", move || async move {
        queues.ready_messages(&queues.topic).await.ok() == Some(0)
    })
    .await?;
    sleep(Duration::from_secs(1)).await;

    let harness = harness.stop().await?;

    assert_eq!(store.len().await, 1);
    assert_eq!(harness.ready_messages(&harness.topic).await?, 0);
    assert_eq!(harness.ready_messages(&harness.dead_letter_queue()).await?, 0);

    Ok(())
}

/// Test: Messages published through the client are consumed under their id
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a Docker daemon"]
async fn test_published_event_is_consumed() -> Result<()> {
    let (_container, url) = containers::rabbitmq().await?;
    let store = Arc::new(InMemoryStore::default());
    let harness = Harness::start(&url, store.clone()).await?;

    let message_id = harness.client.publish(&harness.topic, &event_bytes()).await?;

    let probe = Arc::clone(&store);
    let id = message_id.clone();
    eventually("the published event to be stored", move || {
        let store = Arc::clone(&probe);
        let id = id.clone();
        async move { store.find_by_delivery_id(&id).await.ok().flatten().is_some() }
    })
    .await?;

    let record = store
        .find_by_delivery_id(&message_id)
        .await?
        .ok_or_else(|| anyhow!("record missing"))?;
    assert_eq!(record.user_id, "user_123");

    Ok(())
}
