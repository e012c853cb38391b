//! Expiry tracking for topics and outstanding requests.
//!
//! Targets are swept on heartbeat pulses. A sweep removes every target whose
//! expiry is at or before now, in insertion order, and emits one `Expired`
//! event per target before returning.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::{ExpirerError, Reason, StoreError};
use crate::heartbeat::{Heartbeat, HeartbeatEvent};
use crate::storage::{KeyValueStorage, StorageKey};
use crate::store::Store;

const EVENT_CAPACITY: usize = 256;

/// Storage kind of the expirer collection.
pub const EXPIRER_CONTEXT: &str = "expirer";

/// Something with a lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExpiryTarget {
    Topic(String),
    Id(u64),
}

impl fmt::Display for ExpiryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryTarget::Topic(topic) => write!(f, "topic:{}", topic),
            ExpiryTarget::Id(id) => write!(f, "id:{}", id),
        }
    }
}

impl FromStr for ExpiryTarget {
    type Err = ExpirerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(topic) = s.strip_prefix("topic:") {
            return Ok(ExpiryTarget::Topic(topic.to_string()));
        }
        s.strip_prefix("id:")
            .and_then(|id| id.parse().ok())
            .map(ExpiryTarget::Id)
            .ok_or_else(|| ExpirerError::NotFound(s.to_string()))
    }
}

impl Serialize for ExpiryTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExpiryTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    pub target: ExpiryTarget,
    /// Unix seconds
    pub expiry: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpirerEvent {
    Created(Expiration),
    Expired(Expiration),
}

pub struct Expirer {
    records: Store<Expiration>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<ExpirerEvent>,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: &StorageKey, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: Store::new(storage, key, EXPIRER_CONTEXT),
            clock,
            events,
        }
    }

    pub async fn init(&self) -> Result<(), ExpirerError> {
        self.records.init().await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Register or overwrite the expiry of a target.
    pub async fn set(&self, target: ExpiryTarget, expiry: u64) -> Result<(), ExpirerError> {
        let expiration = Expiration {
            target: target.clone(),
            expiry,
        };
        debug!(target = %target, expiry, "expiry registered");
        let persisted = self.records.set(&target.to_string(), expiration.clone()).await;
        let _ = self.events.send(ExpirerEvent::Created(expiration));
        persisted?;
        Ok(())
    }

    pub fn get(&self, target: &ExpiryTarget) -> Result<Expiration, ExpirerError> {
        let key = target.to_string();
        self.records.get(&key).map_err(|e| match e {
            StoreError::NotFound { .. } => ExpirerError::NotFound(key),
            other => other.into(),
        })
    }

    pub fn has(&self, target: &ExpiryTarget) -> bool {
        self.records.contains(&target.to_string())
    }

    /// Remove a target without emitting an expiration.
    pub async fn del(&self, target: &ExpiryTarget) -> Result<(), ExpirerError> {
        let key = target.to_string();
        if !self.records.contains(&key) {
            return Err(ExpirerError::NotFound(key));
        }
        self.records.delete(&key, Reason::user_disconnected()).await?;
        Ok(())
    }

    pub fn values(&self) -> Vec<Expiration> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Expire every target due at or before now.
    pub async fn sweep(&self) -> Result<Vec<Expiration>, ExpirerError> {
        let now = self.clock.now();
        let due: Vec<Expiration> = self
            .records
            .values()
            .into_iter()
            .filter(|e| e.expiry <= now)
            .collect();

        for expiration in &due {
            self.records
                .delete(&expiration.target.to_string(), Reason::expired())
                .await?;
            info!(target = %expiration.target, expiry = expiration.expiry, "expired");
            let _ = self.events.send(ExpirerEvent::Expired(expiration.clone()));
        }
        Ok(due)
    }

    /// Sweep on every heartbeat pulse until the heartbeat stops.
    pub fn spawn_sweeper(self: &Arc<Self>, heartbeat: &Heartbeat) -> JoinHandle<()> {
        let expirer = Arc::clone(self);
        let mut pulses = heartbeat.subscribe();
        tokio::spawn(async move {
            loop {
                match pulses.recv().await {
                    Ok(HeartbeatEvent::Pulse) => {
                        if let Err(e) = expirer.sweep().await {
                            warn!(error = %e, "expiry sweep failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "sweeper lagged behind heartbeat");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
