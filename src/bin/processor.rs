use std::sync::Arc;

use activity_pipeline::{
    api::{ProcessorState, processor_router, run_api_server},
    clients::{open_store, rbmq::RabbitMqClient},
    config::{ChannelBackend, Config},
    utils::{init_tracing, shutdown_signal},
};
use anyhow::{Error, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        topic = %config.pubsub_topic_id,
        backend = ?config.channel_backend,
        "Starting activity processor"
    );

    let store = open_store(&config)?;
    let state = ProcessorState::new(Arc::clone(&store));

    let result = match config.channel_backend {
        ChannelBackend::PubSub => {
            run_api_server(
                processor_router(Arc::new(state)),
                config.processor_port,
                shutdown_signal(),
            )
            .await
        }
        ChannelBackend::RabbitMq => {
            let rabbitmq = Arc::new(RabbitMqClient::connect(&config).await?);
            let state = Arc::new(state.with_channel(rabbitmq.clone()));

            let consumer = Arc::clone(&rabbitmq)
                .run_consumer(Arc::clone(&store), config.worker_concurrency);
            let server = run_api_server(
                processor_router(state),
                config.processor_port,
                shutdown_signal(),
            );

            let result = tokio::select! {
                result = consumer => result,
                result = server => result,
            };

            rabbitmq.close().await;
            result
        }
    };

    store.close().await;
    info!("Activity processor stopped");

    result
}
