//! In-memory store implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{Store, StoreError, StoreSnapshot};

const SINGLETON_KEY: &str = "value";

struct Collection {
    data: BTreeMap<String, Value>,
    is_singleton: bool,
}

/// Thread-safe in-process key/value storage, collection per `store_id`.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a singleton collection holding one record.
    pub fn with_singleton(self, store_id: &str, value: Value) -> Self {
        {
            let mut collections = self.lock();
            let mut data = BTreeMap::new();
            data.insert(SINGLETON_KEY.to_string(), value);
            collections.insert(
                store_id.to_string(),
                Collection {
                    data,
                    is_singleton: true,
                },
            );
        }
        self
    }

    /// Pre-create an enumerable collection from key/value pairs.
    pub fn with_collection(self, store_id: &str, entries: Vec<(String, Value)>) -> Self {
        {
            let mut collections = self.lock();
            collections.insert(
                store_id.to_string(),
                Collection {
                    data: entries.into_iter().collect(),
                    is_singleton: false,
                },
            );
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Collection>> {
        self.collections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, store_id: &str, key: Option<&str>) -> Result<Value, StoreError> {
        let collections = self.lock();
        let collection = collections
            .get(store_id)
            .ok_or_else(|| StoreError::StoreNotFound {
                store_id: store_id.to_string(),
            })?;

        let key = key.unwrap_or(SINGLETON_KEY);
        collection
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound {
                store_id: store_id.to_string(),
                key: key.to_string(),
            })
    }

    async fn write(&self, store_id: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut collections = self.lock();
        let collection = collections
            .entry(store_id.to_string())
            .or_insert_with(|| Collection {
                data: BTreeMap::new(),
                is_singleton: false,
            });
        collection.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn snapshot(&self, store_id: &str) -> Result<StoreSnapshot, StoreError> {
        let collections = self.lock();
        let collection = collections
            .get(store_id)
            .ok_or_else(|| StoreError::StoreNotFound {
                store_id: store_id.to_string(),
            })?;

        Ok(StoreSnapshot {
            count: collection.data.len(),
            keys: collection.data.keys().cloned().collect(),
            data: collection.data.clone(),
            is_singleton: collection.is_singleton,
        })
    }
}
