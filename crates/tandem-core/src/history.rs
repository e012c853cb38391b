//! Correlation ledger for outgoing JSON-RPC requests.
//!
//! Every tracked request gets a record keyed by its id. The first matching
//! response completes the record; anything after that is rejected.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::{HistoryError, Reason, StoreError};
use crate::jsonrpc::{JsonRpcResponse, RequestArguments};
use crate::storage::{KeyValueStorage, StorageKey};
use crate::store::Store;

const EVENT_CAPACITY: usize = 256;

/// Storage kind of the history collection.
pub const HISTORY_CONTEXT: &str = "history";

/// One outgoing request and, once it arrives, its response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRecord {
    pub id: u64,
    pub topic: String,
    pub request: RequestArguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonRpcResponse>,
}

impl JsonRpcRecord {
    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HistoryEvent {
    Created(JsonRpcRecord),
    Resolved(JsonRpcRecord),
    Deleted(JsonRpcRecord),
}

pub struct JsonRpcHistory {
    records: Store<JsonRpcRecord>,
    events: broadcast::Sender<HistoryEvent>,
}

impl JsonRpcHistory {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: &StorageKey) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: Store::new(storage, key, HISTORY_CONTEXT),
            events,
        }
    }

    /// Restore persisted records, including unresolved ones.
    pub async fn init(&self) -> Result<(), HistoryError> {
        self.records.init().await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// Register an outgoing request.
    pub async fn set(
        &self,
        topic: &str,
        id: u64,
        request: RequestArguments,
        chain_id: Option<String>,
    ) -> Result<JsonRpcRecord, HistoryError> {
        let key = id.to_string();
        if self.records.contains(&key) {
            return Err(HistoryError::DuplicateId(id));
        }

        let record = JsonRpcRecord {
            id,
            topic: topic.to_string(),
            request,
            chain_id,
            response: None,
        };
        debug!(id, topic = %topic, method = %record.request.method, "tracking request");

        let persisted = self.records.set(&key, record.clone()).await;
        let _ = self.events.send(HistoryEvent::Created(record.clone()));
        persisted?;
        Ok(record)
    }

    /// Attach a response to its request record.
    pub async fn resolve(&self, response: &JsonRpcResponse) -> Result<JsonRpcRecord, HistoryError> {
        let id = response.id();
        let key = id.to_string();

        let record = match self.records.get(&key) {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => return Err(HistoryError::RecordNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if record.is_resolved() {
            return Err(HistoryError::AlreadyResolved(id));
        }

        let resolved = JsonRpcRecord {
            response: Some(response.clone()),
            ..record
        };
        let persisted = self.records.set(&key, resolved.clone()).await;
        let _ = self.events.send(HistoryEvent::Resolved(resolved.clone()));
        debug!(id, topic = %resolved.topic, error = response.is_error(), "request resolved");

        if let Err(e) = persisted {
            warn!(id, error = %e, "resolved record not persisted");
        }
        Ok(resolved)
    }

    pub fn get(&self, topic: &str, id: u64) -> Result<JsonRpcRecord, HistoryError> {
        let record = self
            .records
            .get(&id.to_string())
            .map_err(|_| HistoryError::RecordNotFound(id))?;
        if record.topic != topic {
            return Err(HistoryError::TopicMismatch {
                id,
                expected: topic.to_string(),
                actual: record.topic,
            });
        }
        Ok(record)
    }

    pub fn exists(&self, topic: &str, id: u64) -> bool {
        self.get(topic, id).is_ok()
    }

    /// Remove every record for the topic.
    pub async fn delete(&self, topic: &str) -> Result<usize, HistoryError> {
        let doomed: Vec<JsonRpcRecord> = self
            .records
            .values()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect();

        for record in &doomed {
            self.records
                .delete(&record.id.to_string(), Reason::user_disconnected())
                .await?;
            let _ = self.events.send(HistoryEvent::Deleted(record.clone()));
        }
        if !doomed.is_empty() {
            debug!(topic = %topic, count = doomed.len(), "purged history");
        }
        Ok(doomed.len())
    }

    /// Remove a single record by id.
    pub async fn delete_record(&self, id: u64) -> Result<Option<JsonRpcRecord>, HistoryError> {
        let removed = self
            .records
            .delete(&id.to_string(), Reason::expired())
            .await?;
        if let Some(record) = &removed {
            let _ = self.events.send(HistoryEvent::Deleted(record.clone()));
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn values(&self) -> Vec<JsonRpcRecord> {
        self.records.values()
    }

    /// Records still waiting for a response.
    pub fn pending(&self) -> Vec<JsonRpcRecord> {
        self.records
            .values()
            .into_iter()
            .filter(|r| !r.is_resolved())
            .collect()
    }
}
