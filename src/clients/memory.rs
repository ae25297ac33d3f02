use std::collections::{HashMap, hash_map::Entry};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    clients::NotificationStore, error::StoreError, models::notification::NotificationRecord,
};

/// Process-local store for `memory://` runs and tests. The map lock makes
/// insert-if-absent atomic.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, NotificationRecord>>,
}

impl InMemoryStore {
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn find_by_delivery_id(
        &self,
        delivery_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(self.records.lock().await.get(delivery_id).cloned())
    }

    async fn insert(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        match self.records.lock().await.entry(record.delivery_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey(record.delivery_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
