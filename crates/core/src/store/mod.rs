//! Persistent store seam.
//!
//! The store is the only state mutated outside a run's private execution
//! context, and only from the output-routing stage of a step — never from
//! preview mode. The engine consumes it through the [`Store`] trait;
//! [`MemoryStore`] is the in-process implementation.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by the persistent store. Normalized to `Store`-kind
/// pipeline errors at the executor boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store '{store_id}' not found")]
    StoreNotFound { store_id: String },
    #[error("Key '{key}' not found in store '{store_id}'")]
    KeyNotFound { store_id: String, key: String },
    #[error("Store operation failed: {0}")]
    Io(String),
}

/// A read-only snapshot of one collection, used as step input.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub count: usize,
    pub keys: Vec<String>,
    /// Ordered for stable prompt rendering.
    pub data: BTreeMap<String, Value>,
    /// A singleton store holds exactly one record under one well-known key.
    pub is_singleton: bool,
}

/// Key/value persistence for named collections.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, store_id: &str, key: Option<&str>) -> Result<Value, StoreError>;

    async fn write(&self, store_id: &str, key: &str, value: Value) -> Result<(), StoreError>;

    async fn snapshot(&self, store_id: &str) -> Result<StoreSnapshot, StoreError>;
}
