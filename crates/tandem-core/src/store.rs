//! Persistent keyed collection with change events.
//!
//! A `Store` keeps every record of one kind in an insertion-ordered map and
//! writes the whole collection to its storage key after each mutation.
//! Reads are always served from memory.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::errors::{Reason, StoreError};
use crate::storage::{KeyValueStorage, StorageKey};

const EVENT_CAPACITY: usize = 256;

/// Bounds for values kept in a [`Store`].
pub trait StoreValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Change notifications emitted by a [`Store`].
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent<T> {
    Created { key: String, value: T },
    Updated { key: String, value: T },
    Deleted { key: String, value: T, reason: Reason },
}

pub struct Store<T> {
    context: String,
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    map: RwLock<IndexMap<String, T>>,
    persist_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent<T>>,
}

impl<T: StoreValue> Store<T> {
    /// Create an empty store for `context`, persisted under `key.for_kind(context)`.
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: &StorageKey, context: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            context: context.to_string(),
            storage_key: key.for_kind(context),
            storage,
            map: RwLock::new(IndexMap::new()),
            persist_lock: Mutex::new(()),
            events,
        }
    }

    /// Load persisted records. A missing key yields an empty store.
    pub async fn init(&self) -> Result<(), StoreError> {
        let Some(value) = self.storage.get_item(&self.storage_key).await? else {
            debug!(context = %self.context, "no persisted records");
            return Ok(());
        };

        let entries: Vec<(String, T)> = serde_json::from_value(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let count = entries.len();

        let mut map = self.map.write();
        for (key, value) in entries {
            map.insert(key, value);
        }
        debug!(context = %self.context, count, "restored records");
        Ok(())
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<T>> {
        self.events.subscribe()
    }

    /// Insert or replace a record.
    pub async fn set(&self, key: &str, value: T) -> Result<(), StoreError> {
        let existed = self
            .map
            .write()
            .insert(key.to_string(), value.clone())
            .is_some();

        let event = if existed {
            StoreEvent::Updated {
                key: key.to_string(),
                value,
            }
        } else {
            StoreEvent::Created {
                key: key.to_string(),
                value,
            }
        };
        let _ = self.events.send(event);
        self.persist().await
    }

    pub fn get(&self, key: &str) -> Result<T, StoreError> {
        self.map
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Apply `f` to an existing record and persist the result.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut T),
    {
        let updated = {
            let mut map = self.map.write();
            let value = map.get_mut(key).ok_or_else(|| self.not_found(key))?;
            f(value);
            value.clone()
        };

        let _ = self.events.send(StoreEvent::Updated {
            key: key.to_string(),
            value: updated.clone(),
        });
        self.persist().await?;
        Ok(updated)
    }

    /// Remove a record. Removing an absent key is a no-op and emits nothing.
    pub async fn delete(&self, key: &str, reason: Reason) -> Result<Option<T>, StoreError> {
        let removed = self.map.write().shift_remove(key);
        let Some(value) = removed else {
            return Ok(None);
        };

        let _ = self.events.send(StoreEvent::Deleted {
            key: key.to_string(),
            value: value.clone(),
            reason,
        });
        self.persist().await?;
        Ok(Some(value))
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.map.read().values().cloned().collect()
    }

    /// Snapshot of `(key, value)` pairs in insertion order.
    pub fn entries(&self) -> Vec<(String, T)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::NotFound {
            context: self.context.clone(),
            key: key.to_string(),
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        // Snapshot under the persist lock so concurrent writers land in order.
        let _guard = self.persist_lock.lock().await;
        let snapshot = serde_json::to_value(self.entries())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Err(e) = self.storage.set_item(&self.storage_key, snapshot).await {
            warn!(context = %self.context, error = %e, "failed to persist records");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn key() -> StorageKey {
        StorageKey::new("wc", 2, "test", "0.3")
    }

    #[tokio::test]
    async fn test_missing_storage_key_yields_empty_store() {
        let store: Store<u32> = Store::new(Arc::new(MemoryStorage::new()), &key(), "numbers");
        store.init().await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.get("a"), Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_set_get_update_delete_emit_events() {
        let store: Store<u32> = Store::new(Arc::new(MemoryStorage::new()), &key(), "numbers");
        let mut events = store.subscribe();

        store.set("a", 1).await.unwrap();
        store.set("a", 2).await.unwrap();
        assert_eq!(store.update("a", |v| *v += 10).await.unwrap(), 12);
        assert_eq!(store.get("a").unwrap(), 12);
        store.delete("a", Reason::expired()).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Created { value: 1, .. }));
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Updated { value: 2, .. }));
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Updated { value: 12, .. }));
        match events.recv().await.unwrap() {
            StoreEvent::Deleted { key, reason, .. } => {
                assert_eq!(key, "a");
                assert_eq!(reason, Reason::expired());
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(store.delete("a", Reason::expired()).await.unwrap(), None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_records_survive_reinit_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        let store: Store<String> = Store::new(storage.clone(), &key(), "names");
        store.set("z", "last-key-first".into()).await.unwrap();
        store.set("a", "second".into()).await.unwrap();

        let restored: Store<String> = Store::new(storage, &key(), "names");
        restored.init().await.unwrap();
        assert_eq!(restored.keys(), vec!["z".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory() {
        let storage = Arc::new(MemoryStorage::new());
        let store: Store<u32> = Store::new(storage.clone(), &key(), "numbers");
        storage.set_fail_writes(true);

        let result = store.set("a", 7).await;
        assert!(matches!(result, Err(StoreError::Storage(_))));
        assert_eq!(store.get("a").unwrap(), 7);
    }
}
