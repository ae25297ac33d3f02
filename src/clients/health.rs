use std::{collections::BTreeMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::{EventPublisher, NotificationStore},
    models::health::{Dependency, DependencyHealth, ReadinessReport},
};

/// Readiness probe over whichever collaborators a service was built with.
#[derive(Clone, Default)]
pub struct HealthChecker {
    publisher: Option<Arc<dyn EventPublisher>>,
    store: Option<Arc<dyn NotificationStore>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn check_all(&self) -> ReadinessReport {
        let mut checks = BTreeMap::new();

        if let Some(publisher) = &self.publisher {
            let start = Instant::now();
            let result = publisher.health_check().await.map_err(|e| e.to_string());
            checks.insert(
                Dependency::MessageBroker,
                observe(Dependency::MessageBroker, start, result),
            );
        }

        if let Some(store) = &self.store {
            let start = Instant::now();
            let result = store.health_check().await.map_err(|e| e.to_string());
            checks.insert(Dependency::Database, observe(Dependency::Database, start, result));
        }

        ReadinessReport::from_checks(checks)
    }
}

fn observe(dependency: Dependency, start: Instant, result: Result<(), String>) -> DependencyHealth {
    match result {
        Ok(()) => {
            let elapsed = start.elapsed().as_millis() as u64;
            debug!(?dependency, latency_ms = elapsed, "Health check passed");
            DependencyHealth::reachable(elapsed)
        }
        Err(error) => {
            warn!(?dependency, %error, "Health check failed");
            DependencyHealth::unreachable(error)
        }
    }
}
