use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use gcp_auth::TokenProvider;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::{
    clients::EventPublisher,
    config::Config,
    error::PublishError,
    models::message::{PublishMessage, PublishRequest, PublishResponse},
};

const PUBSUB_API_URL: &str = "https://pubsub.googleapis.com";
const PUBSUB_SCOPES: &[&str] = &["https://www.googleapis.com/auth/pubsub"];

enum Credentials {
    /// The emulator accepts unauthenticated requests.
    None,
    /// Application default credentials, resolved on first use.
    Google(OnceCell<Arc<dyn TokenProvider>>),
}

/// Google Cloud Pub/Sub publisher over the REST API.
pub struct PubSubClient {
    http_client: Client,
    base_url: String,
    project_id: String,
    credentials: Credentials,
    timeout: Duration,
    provisioned_topics: Mutex<HashSet<String>>,
}

impl PubSubClient {
    pub fn from_config(config: &Config) -> Result<Self, PublishError> {
        let http_client = Client::builder()
            .timeout(config.publish_timeout())
            .build()?;

        let emulator_host = config
            .pubsub_emulator_host
            .as_deref()
            .filter(|host| !host.is_empty());

        let client = match emulator_host {
            Some(host) => {
                info!(emulator_host = %host, project_id = %config.gcp_project_id, "Using Pub/Sub emulator");
                Self::new(
                    http_client,
                    format!("http://{}", host),
                    &config.gcp_project_id,
                    Credentials::None,
                    config.publish_timeout(),
                )
            }
            None => {
                info!(project_id = %config.gcp_project_id, "Using Google Cloud Pub/Sub");
                Self::new(
                    http_client,
                    PUBSUB_API_URL.to_string(),
                    &config.gcp_project_id,
                    Credentials::Google(OnceCell::new()),
                    config.publish_timeout(),
                )
            }
        };

        Ok(client)
    }

    /// Client for an unauthenticated endpoint such as the emulator.
    pub fn emulator(base_url: &str, project_id: &str, timeout: Duration) -> Result<Self, PublishError> {
        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self::new(
            http_client,
            base_url.trim_end_matches('/').to_string(),
            project_id,
            Credentials::None,
            timeout,
        ))
    }

    fn new(
        http_client: Client,
        base_url: String,
        project_id: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            base_url,
            project_id: project_id.to_string(),
            credentials,
            timeout,
            provisioned_topics: Mutex::new(HashSet::new()),
        }
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/v1/projects/{}/topics/{}", self.base_url, self.project_id, topic)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, PublishError> {
        match &self.credentials {
            Credentials::None => Ok(request),
            Credentials::Google(provider) => {
                let provider = provider
                    .get_or_try_init(gcp_auth::provider)
                    .await
                    .map_err(|e| PublishError::Auth(e.to_string()))?;

                let token = provider
                    .token(PUBSUB_SCOPES)
                    .await
                    .map_err(|e| PublishError::Auth(e.to_string()))?;

                Ok(request.bearer_auth(token.as_str()))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, PublishError> {
        self.authorized(request).await?.send().await.map_err(|e| {
            if e.is_timeout() {
                PublishError::Timeout(self.timeout)
            } else {
                PublishError::Transport(e)
            }
        })
    }

    /// Creates the topic when it does not exist yet. A topic created by a
    /// concurrent publisher in between (409) counts as provisioned.
    async fn ensure_topic(&self, topic: &str) -> Result<(), PublishError> {
        if self.provisioned_topics.lock().await.contains(topic) {
            return Ok(());
        }

        let url = self.topic_url(topic);
        let response = self.send(self.http_client.get(&url)).await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                info!(topic, "Topic not found, creating it");

                let created = self
                    .send(self.http_client.put(&url).json(&serde_json::json!({})))
                    .await?;

                if !created.status().is_success() && created.status() != StatusCode::CONFLICT {
                    return Err(rejected(created).await);
                }

                info!(topic, "Topic created");
            }
            _ => return Err(rejected(response).await),
        }

        self.provisioned_topics.lock().await.insert(topic.to_string());

        Ok(())
    }
}

async fn rejected(response: Response) -> PublishError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    PublishError::Rejected { status, body }
}

#[async_trait]
impl EventPublisher for PubSubClient {
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PublishError> {
        debug!(topic, "Preparing to publish to topic");

        self.ensure_topic(topic).await?;

        let request = PublishRequest {
            messages: vec![PublishMessage {
                data: STANDARD.encode(data),
            }],
        };

        let url = format!("{}:publish", self.topic_url(topic));
        let response = self.send(self.http_client.post(&url).json(&request)).await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let status = response.status().as_u16();
        let published: PublishResponse = response.json().await?;

        let message_id = published
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::Rejected {
                status,
                body: "publish response carried no message id".to_string(),
            })?;

        info!(message_id = %message_id, topic, "Message published to topic");

        Ok(message_id)
    }

    async fn health_check(&self) -> Result<(), PublishError> {
        let url = format!("{}/v1/projects/{}/topics", self.base_url, self.project_id);

        let response = self
            .send(self.http_client.get(&url).query(&[("pageSize", "1")]))
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejected(response).await)
        }
    }
}
