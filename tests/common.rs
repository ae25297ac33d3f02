use std::sync::Mutex;

use activity_pipeline::{
    clients::{EventPublisher, NotificationStore, memory::InMemoryStore},
    error::{PublishError, StoreError},
    models::notification::NotificationRecord,
};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use serde_json::Value as JsonValue;
use tower::ServiceExt;

/// Publisher double that records every publish attempt.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PublishError> {
        let mut published = self.published.lock().unwrap();
        published.push((topic.to_string(), data.to_vec()));

        if self.fail {
            return Err(PublishError::Broker("channel unavailable".to_string()));
        }

        Ok(format!("msg-{}", published.len()))
    }

    async fn health_check(&self) -> Result<(), PublishError> {
        if self.fail {
            Err(PublishError::Broker("channel unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Store whose lookup never sees existing records, so two deliveries of the
/// same id both reach the insert and race on the uniqueness guard.
#[derive(Default)]
pub struct BlindLookupStore {
    pub inner: InMemoryStore,
}

#[async_trait]
impl NotificationStore for BlindLookupStore {
    async fn find_by_delivery_id(
        &self,
        _delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(None)
    }

    async fn insert(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store that is reachable but fails every write.
pub struct BrokenWriteStore;

#[async_trait]
impl NotificationStore for BrokenWriteStore {
    async fn find_by_delivery_id(
        &self,
        _delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(None)
    }

    async fn insert(&self, _record: &NotificationRecord) -> Result<(), StoreError> {
        Err(StoreError::Query("disk full".to_string()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Err(StoreError::Query("disk full".to_string()))
    }
}

/// Store that refuses every record's contents, as Postgres does for text
/// containing NUL bytes.
pub struct RefusingStore;

#[async_trait]
impl NotificationStore for RefusingStore {
    async fn find_by_delivery_id(
        &self,
        _delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(None)
    }

    async fn insert(&self, _record: &NotificationRecord) -> Result<(), StoreError> {
        Err(StoreError::InvalidData(
            "invalid byte sequence for encoding \"UTF8\": 0x00 (22021)".to_string(),
        ))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub async fn post_json(app: Router, uri: &str, body: impl Into<String>) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.into()))
        .unwrap();

    app.oneshot(request).await.unwrap()
}

/// Posts a body without any content type header.
pub async fn post_untyped(app: Router, uri: &str, body: impl Into<String>) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::from(body.into()))
        .unwrap();

    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> JsonValue {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
