//! Key/value storage backend consumed by [`crate::store::Store`].
//!
//! Each store owns exactly one key in the backend, computed by
//! [`StorageKey::for_kind`], and writes its whole collection under it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::StorageError;

// ============================================================================
// Storage Key
// ============================================================================

/// Namespace shared by every collection of one client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageKey {
    pub protocol: String,
    pub version: u32,
    pub context: String,
    pub storage_version: String,
}

impl StorageKey {
    pub fn new(
        protocol: impl Into<String>,
        version: u32,
        context: impl Into<String>,
        storage_version: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            version,
            context: context.into(),
            storage_version: storage_version.into(),
        }
    }

    /// `protocol@version:context:storageVersion//kind`
    pub fn for_kind(&self, kind: &str) -> String {
        format!(
            "{}@{}:{}:{}//{}",
            self.protocol, self.version, self.context, self.storage_version, kind
        )
    }
}

// ============================================================================
// Storage Trait
// ============================================================================

/// Namespaced key/value storage.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Read a value. A missing key is `Ok(None)`.
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory storage for tests and ephemeral clients.
///
/// Writes can be made to fail on demand to exercise persistence errors.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    items: Arc<RwLock<HashMap<String, Value>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.check_writable()?;
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.items.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
