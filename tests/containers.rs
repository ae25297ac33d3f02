//! Throwaway backing services for the tests that need a real broker or
//! store. Each helper returns the running container, which must be kept
//! alive for as long as the URL is used.

use std::{future::Future, time::Duration};

use anyhow::{Result, anyhow};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::time::{Instant, sleep};

pub type Container = ContainerAsync<GenericImage>;

pub async fn postgres() -> Result<(Container, String)> {
    let container = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "notifications")
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432.tcp()).await?;

    Ok((
        container,
        format!("postgres://postgres:postgres@{}:{}/notifications", host, port),
    ))
}

pub async fn redis() -> Result<(Container, String)> {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(6379.tcp()).await?;

    Ok((container, format!("redis://{}:{}", host, port)))
}

/// The default guest account only accepts loopback connections, so the
/// broker gets its own user.
pub async fn rabbitmq() -> Result<(Container, String)> {
    let container = GenericImage::new("rabbitmq", "3.13-alpine")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"))
        .with_env_var("RABBITMQ_DEFAULT_USER", "pipeline")
        .with_env_var("RABBITMQ_DEFAULT_PASS", "pipeline")
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5672.tcp()).await?;

    Ok((
        container,
        format!("amqp://pipeline:pipeline@{}:{}/%2f", host, port),
    ))
}

/// Polls `check` until it holds or 30 seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(30);

    while Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        sleep(Duration::from_millis(200)).await;
    }

    Err(anyhow!("timed out waiting for {}", what))
}
