use std::sync::Arc;

use activity_pipeline::{
    api::{PublisherState, publisher_router, run_api_server},
    clients::open_publisher,
    config::Config,
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
        "Starting activity publisher"
    );

    let publisher = open_publisher(&config).await?;
    let state = Arc::new(PublisherState::new(publisher, config.pubsub_topic_id.clone()));

    run_api_server(publisher_router(state), config.server_port, shutdown_signal()).await?;

    info!("Activity publisher stopped");

    Ok(())
}
