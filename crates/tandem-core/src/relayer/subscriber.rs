//! Topic subscriptions and resubscription after reconnect.
//!
//! The subscriber keeps two views:
//! - Live subscriptions (`ids`, `topics`, `topic_map`), valid only for the
//!   current connection and cleared on disconnect
//! - Known topics, persisted, from which every live subscription is rebuilt
//!   after a reconnect

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tandem_transport::{Backoff, RelayRequest, RelayTransport, TransportError};

use crate::errors::{Reason, RelayerError};
use crate::storage::{KeyValueStorage, StorageKey};
use crate::store::Store;

const EVENT_CAPACITY: usize = 256;

/// Storage kind of the known-topic collection.
pub const SUBSCRIPTION_CONTEXT: &str = "subscription";

/// A live relay subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
}

/// A topic we intend to stay subscribed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub topic: String,
    pub relay_protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberEvent {
    Created(Subscription),
    Deleted {
        subscription: Subscription,
        reason: Reason,
    },
    Enabled,
    Disabled,
}

#[derive(Default)]
struct LiveState {
    ids: Vec<String>,
    topics: Vec<String>,
    topic_map: IndexMap<String, Vec<String>>,
    enabled: bool,
}

impl LiveState {
    fn add(&mut self, subscription: &Subscription) {
        self.ids.push(subscription.id.clone());
        if !self.topics.contains(&subscription.topic) {
            self.topics.push(subscription.topic.clone());
        }
        self.topic_map
            .entry(subscription.topic.clone())
            .or_default()
            .push(subscription.id.clone());
    }

    fn remove(&mut self, topic: &str, id: &str) {
        self.ids.retain(|i| i != id);
        if let Some(ids) = self.topic_map.get_mut(topic) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.topic_map.shift_remove(topic);
                self.topics.retain(|t| t != topic);
            }
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.topics.clear();
        self.topic_map.clear();
    }
}

pub struct Subscriber {
    transport: Arc<dyn RelayTransport>,
    backoff: Backoff,
    relay_protocol: String,
    known: Store<SubscriptionParams>,
    live: Mutex<LiveState>,
    batch: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SubscriberEvent>,
}

impl Subscriber {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn KeyValueStorage>,
        key: &StorageKey,
        backoff: Backoff,
        relay_protocol: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            backoff,
            relay_protocol: relay_protocol.into(),
            known: Store::new(storage, key, SUBSCRIPTION_CONTEXT),
            live: Mutex::new(LiveState::default()),
            batch: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Restore known topics from storage.
    pub async fn init(&self) -> Result<(), RelayerError> {
        self.known.init().await?;
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.events.subscribe()
    }

    /// Subscribe to a topic. Returns `None` if the connection is down; the
    /// topic is then subscribed on reconnect.
    pub async fn subscribe(&self, topic: &str) -> Result<Option<String>, RelayerError> {
        if !self.known.contains(topic) {
            self.known
                .set(
                    topic,
                    SubscriptionParams {
                        topic: topic.to_string(),
                        relay_protocol: self.relay_protocol.clone(),
                    },
                )
                .await?;
        }

        if !self.transport.is_connected() {
            debug!(topic = %topic, "connection down, subscription deferred");
            return Ok(None);
        }

        let subscription = self.subscribe_live(topic).await?;
        Ok(Some(subscription.id))
    }

    /// Remove one subscription id, or every id for the topic.
    pub async fn unsubscribe(&self, topic: &str, id: Option<&str>) -> Result<(), RelayerError> {
        let ids: Vec<String> = {
            let live = self.live.lock();
            let current = live.topic_map.get(topic).cloned().unwrap_or_default();
            match id {
                Some(id) => current.into_iter().filter(|i| i == id).collect(),
                None => current,
            }
        };

        for id in &ids {
            if self.transport.is_connected() {
                let request = RelayRequest::Unsubscribe {
                    topic: topic.to_string(),
                    id: id.clone(),
                };
                match self.transport.request(request).await {
                    Ok(_) | Err(TransportError::Disconnected) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.live.lock().remove(topic, id);
            let subscription = Subscription {
                id: id.clone(),
                topic: topic.to_string(),
            };
            debug!(topic = %topic, id = %id, "unsubscribed");
            let _ = self.events.send(SubscriberEvent::Deleted {
                subscription,
                reason: Reason::user_disconnected(),
            });
        }

        let still_live = self.live.lock().topic_map.contains_key(topic);
        if !still_live {
            self.known.delete(topic, Reason::user_disconnected()).await?;
        }
        Ok(())
    }

    /// Drop all live state after the connection went away.
    pub fn on_disconnect(&self) {
        let mut live = self.live.lock();
        live.clear();
        let was_enabled = std::mem::replace(&mut live.enabled, false);
        drop(live);

        if was_enabled {
            info!("subscriptions disabled");
        }
        let _ = self.events.send(SubscriberEvent::Disabled);
    }

    /// Resubscribe every known topic. `Enabled` fires once the whole batch
    /// succeeded.
    pub async fn on_reconnect(&self) -> Result<(), RelayerError> {
        let _batch = self.batch.lock().await;
        {
            let mut live = self.live.lock();
            live.clear();
            live.enabled = false;
        }

        let topics = self.known.keys();
        for topic in &topics {
            if let Err(e) = self.subscribe_live(topic).await {
                warn!(topic = %topic, error = %e, "resubscribe failed");
                return Err(e);
            }
        }

        self.live.lock().enabled = true;
        info!(count = topics.len(), "subscriptions enabled");
        let _ = self.events.send(SubscriberEvent::Enabled);
        Ok(())
    }

    /// Resubscribe if connected but not enabled. Skips if a batch is running.
    pub async fn check_health(&self) {
        if !self.transport.is_connected() || self.is_enabled() {
            return;
        }
        if self.batch.try_lock().is_err() {
            return;
        }
        debug!("subscriber unhealthy, resubscribing");
        if let Err(e) = self.on_reconnect().await {
            warn!(error = %e, "health check resubscribe failed");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.live.lock().enabled
    }

    pub fn ids(&self) -> Vec<String> {
        self.live.lock().ids.clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.live.lock().topics.clone()
    }

    pub fn topic_map(&self) -> IndexMap<String, Vec<String>> {
        self.live.lock().topic_map.clone()
    }

    /// Whether the topic has a live subscription.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.live.lock().topic_map.contains_key(topic)
    }

    pub fn known_topics(&self) -> Vec<String> {
        self.known.keys()
    }

    async fn subscribe_live(&self, topic: &str) -> Result<Subscription, RelayerError> {
        let transport = &self.transport;
        let response = self
            .backoff
            .retry(|_| {
                let request = RelayRequest::Subscribe {
                    topic: topic.to_string(),
                };
                async move {
                    match transport.request(request).await {
                        Ok(response) => Ok(Ok(response)),
                        Err(e) if e.is_transient() => Err(e),
                        Err(e) => Ok(Err(e)),
                    }
                }
            })
            .await
            .map_err(|exhausted| RelayerError::SubscribeFailed {
                topic: topic.to_string(),
                detail: format!(
                    "{} after {} attempts",
                    exhausted.last_error, exhausted.attempts
                ),
            })??;

        let id = response
            .subscription_id()
            .ok_or_else(|| RelayerError::SubscribeFailed {
                topic: topic.to_string(),
                detail: "relay answered without a subscription id".into(),
            })?
            .to_string();

        let subscription = Subscription {
            id,
            topic: topic.to_string(),
        };
        self.live.lock().add(&subscription);
        debug!(topic = %topic, id = %subscription.id, "subscribed");
        let _ = self.events.send(SubscriberEvent::Created(subscription.clone()));
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tandem_transport::MemoryRelay;

    fn subscriber(transport: Arc<dyn RelayTransport>) -> Subscriber {
        Subscriber::new(
            transport,
            Arc::new(MemoryStorage::new()),
            &StorageKey::new("wc", 2, "test", "0.3"),
            Backoff::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            "irn",
        )
    }

    #[tokio::test]
    async fn test_each_subscribe_gets_its_own_id() {
        let relay = MemoryRelay::new();
        let client = relay.client();
        client.connect().await.unwrap();
        let sub = subscriber(client);

        let a = sub.subscribe("t").await.unwrap().unwrap();
        let b = sub.subscribe("t").await.unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(sub.topics(), vec!["t".to_string()]);
        assert_eq!(sub.topic_map()["t"], vec![a.clone(), b.clone()]);

        sub.unsubscribe("t", Some(&a)).await.unwrap();
        assert_eq!(sub.ids(), vec![b]);
        assert_eq!(sub.known_topics(), vec!["t".to_string()]);

        sub.unsubscribe("t", None).await.unwrap();
        assert!(sub.ids().is_empty());
        assert!(sub.topic_map().is_empty());
        assert!(sub.known_topics().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_clears_and_reconnect_resubscribes() {
        let relay = MemoryRelay::new();
        let client = relay.client();
        client.connect().await.unwrap();
        let sub = subscriber(client.clone());
        let mut events = sub.subscribe_events();

        let before = sub.subscribe("topic-a").await.unwrap().unwrap();
        assert!(matches!(events.recv().await.unwrap(), SubscriberEvent::Created(_)));

        client.simulate_disconnect();
        sub.on_disconnect();
        assert!(sub.ids().is_empty());
        assert!(sub.topics().is_empty());
        assert!(!sub.is_enabled());
        assert_eq!(events.recv().await.unwrap(), SubscriberEvent::Disabled);

        client.simulate_reconnect();
        sub.on_reconnect().await.unwrap();
        match events.recv().await.unwrap() {
            SubscriberEvent::Created(s) => assert_eq!(s.topic, "topic-a"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events.recv().await.unwrap(), SubscriberEvent::Enabled);

        assert_eq!(sub.topics(), vec!["topic-a".to_string()]);
        let ids = &sub.topic_map()["topic-a"];
        assert!(!ids.is_empty());
        assert_ne!(ids[0], before);
        assert_eq!(relay.subscriber_count("topic-a"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_is_deferred() {
        let relay = MemoryRelay::new();
        let client = relay.client();
        let sub = subscriber(client.clone());

        assert_eq!(sub.subscribe("later").await.unwrap(), None);
        assert!(sub.topics().is_empty());
        assert_eq!(sub.known_topics(), vec!["later".to_string()]);

        client.connect().await.unwrap();
        sub.check_health().await;
        assert!(sub.is_enabled());
        assert!(sub.is_subscribed("later"));
    }

    #[tokio::test]
    async fn test_subscribe_retries_transient_failures() {
        let relay = MemoryRelay::new();
        let client = relay.client();
        client.connect().await.unwrap();
        client.fail_next_requests(2);
        let sub = subscriber(client);

        assert!(sub.subscribe("t").await.unwrap().is_some());
    }
}
