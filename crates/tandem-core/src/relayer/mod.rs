//! Resilient relay transport.
//!
//! The relayer owns the single upstream connection and multiplexes every
//! topic over it:
//! - `Publisher` sends with acknowledgement, backoff and a disconnect queue
//! - `Subscriber` tracks live subscriptions and rebuilds them on reconnect
//! - Transport events are turned into `RelayerEvent`s for the dispatcher

pub mod publisher;
pub mod subscriber;

pub use publisher::{
    FailedPublish, FlushReport, Publisher, PublisherConfig, QueuedPublish, DEFAULT_ACK_TIMEOUT,
};
pub use subscriber::{Subscriber, SubscriberEvent, Subscription, SubscriptionParams};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_transport::{
    Backoff, ConnectionManager, ConnectionState, PublishOptions, RelayMessage, RelayTransport,
    TransportEvent,
};

use crate::errors::RelayerError;
use crate::heartbeat::{Heartbeat, HeartbeatEvent};
use crate::storage::{KeyValueStorage, StorageKey};

const EVENT_CAPACITY: usize = 1024;

/// Default relay protocol name.
pub const DEFAULT_RELAY_PROTOCOL: &str = "irn";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayerEvent {
    Connected,
    Disconnected,
    /// Still-encoded payload received on a subscribed topic
    Message(RelayMessage),
    /// A publish queued during a disconnect could not be delivered
    PublishFailed { topic: String, error: RelayerError },
}

#[derive(Clone, Debug)]
pub struct RelayerConfig {
    pub relay_protocol: String,
    pub publisher: PublisherConfig,
    pub subscribe_backoff: Backoff,
    /// Reconnect on our own after the transport drops.
    pub auto_reconnect: bool,
    pub reconnect_backoff: Backoff,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            relay_protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            publisher: PublisherConfig::default(),
            subscribe_backoff: Backoff::default(),
            auto_reconnect: true,
            reconnect_backoff: Backoff::default(),
        }
    }
}

pub struct Relayer {
    transport: Arc<dyn RelayTransport>,
    config: RelayerConfig,
    connection: Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    events: broadcast::Sender<RelayerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Relayer {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn KeyValueStorage>,
        key: &StorageKey,
        config: RelayerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let publisher = Arc::new(Publisher::new(transport.clone(), config.publisher.clone()));
        let subscriber = Arc::new(Subscriber::new(
            transport.clone(),
            storage,
            key,
            config.subscribe_backoff,
            config.relay_protocol.clone(),
        ));
        Self {
            transport,
            config,
            connection: Arc::new(ConnectionManager::new()),
            publisher,
            subscriber,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect, restore known subscriptions and start the event loop.
    pub async fn init(self: &Arc<Self>, heartbeat: &Heartbeat) -> Result<(), RelayerError> {
        self.subscriber.init().await?;

        // Take the receiver before connecting so no event is missed.
        let transport_events = self.transport.events();

        self.connection.transition(ConnectionState::Connecting);
        self.transport.connect().await?;
        self.connection.transition(ConnectionState::Connected);
        self.subscriber.on_reconnect().await?;
        self.flush_queue().await;
        info!(protocol = %self.config.relay_protocol, "relayer connected");

        let event_loop = self.spawn_event_loop(transport_events);
        let health = self.spawn_health_check(heartbeat);
        self.tasks.lock().extend([event_loop, health]);
        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<RelayerEvent> {
        self.events.subscribe()
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn reconnects(&self) -> u32 {
        self.connection.reconnects()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        opts: PublishOptions,
    ) -> Result<(), RelayerError> {
        self.publisher.publish(topic, message, opts).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Option<String>, RelayerError> {
        self.subscriber.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), RelayerError> {
        self.subscriber.unsubscribe(topic, None).await
    }

    /// Stop background tasks and close the connection.
    pub async fn shutdown(&self) -> Result<(), RelayerError> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.close().await?;
        self.connection.transition(ConnectionState::Disconnected);
        info!("relayer closed");
        Ok(())
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let relayer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::Message(message)) => {
                        let _ = relayer.events.send(RelayerEvent::Message(message));
                    }
                    Ok(TransportEvent::Connected) => relayer.handle_connected().await,
                    Ok(TransportEvent::Disconnected) => relayer.handle_disconnected(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relayer lagged behind transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_health_check(self: &Arc<Self>, heartbeat: &Heartbeat) -> JoinHandle<()> {
        let subscriber = Arc::clone(&self.subscriber);
        let mut pulses = heartbeat.subscribe();
        tokio::spawn(async move {
            loop {
                match pulses.recv().await {
                    Ok(HeartbeatEvent::Pulse) => subscriber.check_health().await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_connected(&self) {
        // Already handled by init or an earlier event.
        if self.connection.transition(ConnectionState::Connected) == ConnectionState::Connected {
            return;
        }
        info!(reconnects = self.connection.reconnects(), "relay connection restored");

        if let Err(e) = self.subscriber.on_reconnect().await {
            warn!(error = %e, "resubscribe after reconnect failed");
        }
        self.flush_queue().await;
        let _ = self.events.send(RelayerEvent::Connected);
    }

    async fn flush_queue(&self) {
        let report = self.publisher.flush_queue().await;
        for FailedPublish { item, error } in report.failed {
            let _ = self.events.send(RelayerEvent::PublishFailed {
                topic: item.topic,
                error,
            });
        }
    }

    fn handle_disconnected(self: &Arc<Self>) {
        let previous = self.connection.transition(ConnectionState::Reconnecting);
        if previous == ConnectionState::Reconnecting {
            return;
        }
        warn!("relay connection lost");
        self.subscriber.on_disconnect();
        let _ = self.events.send(RelayerEvent::Disconnected);

        if self.config.auto_reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let transport = self.transport.clone();
        let backoff = self.config.reconnect_backoff;
        let task = tokio::spawn(async move {
            tokio::time::sleep(backoff.delay(0)).await;
            let result = backoff
                .retry(|attempt| {
                    let transport = transport.clone();
                    async move {
                        debug!(attempt, "reconnecting to relay");
                        transport.connect().await
                    }
                })
                .await;
            if let Err(exhausted) = result {
                warn!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "giving up on relay reconnect"
                );
            }
        });
        self.tasks.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tandem_transport::{MemoryRelay, MemoryRelayClient};

    async fn relayer(client: Arc<MemoryRelayClient>, heartbeat: &Heartbeat) -> Arc<Relayer> {
        let config = RelayerConfig {
            auto_reconnect: false,
            publisher: PublisherConfig {
                ack_timeout: Duration::from_millis(100),
                backoff: Backoff::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            },
            subscribe_backoff: Backoff::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            ..RelayerConfig::default()
        };
        let relayer = Arc::new(Relayer::new(
            client,
            Arc::new(MemoryStorage::new()),
            &StorageKey::new("wc", 2, "test", "0.3"),
            config,
        ));
        relayer.init(heartbeat).await.unwrap();
        relayer
    }

    async fn next_subscriber_event(
        events: &mut broadcast::Receiver<SubscriberEvent>,
    ) -> SubscriberEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("subscriber event")
            .expect("open channel")
    }

    #[tokio::test]
    async fn test_messages_are_reemitted() {
        let relay = MemoryRelay::new();
        let heartbeat = Heartbeat::new(Duration::from_secs(5));
        let alice = relayer(relay.client(), &heartbeat).await;
        let bob = relayer(relay.client(), &heartbeat).await;

        let mut bob_events = bob.events();
        bob.subscribe("t").await.unwrap();
        alice
            .publish("t", "ciphertext", PublishOptions::default())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            RelayerEvent::Message(RelayMessage {
                topic: "t".into(),
                message: "ciphertext".into()
            })
        );
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_with_fresh_id_and_flushes_queue() {
        let relay = MemoryRelay::new();
        let heartbeat = Heartbeat::new(Duration::from_secs(5));
        let client = relay.client();
        let relayer = relayer(client.clone(), &heartbeat).await;
        let mut sub_events = relayer.subscriber().subscribe_events();

        let before = relayer.subscribe("topic-a").await.unwrap().unwrap();
        next_subscriber_event(&mut sub_events).await;

        client.simulate_disconnect();
        assert_eq!(next_subscriber_event(&mut sub_events).await, SubscriberEvent::Disabled);
        relayer
            .publish("topic-a", "queued", PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(relayer.publisher().queue_len(), 1);

        client.simulate_reconnect();
        loop {
            if next_subscriber_event(&mut sub_events).await == SubscriberEvent::Enabled {
                break;
            }
        }

        let ids = relayer.subscriber().topic_map()["topic-a"].clone();
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], before);
        assert_eq!(relayer.reconnects(), 1);

        // Flush runs right after resubscription in the same handler.
        tokio::time::timeout(Duration::from_secs(2), async {
            while relayer.publisher().queue_len() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.published().len(), 1);
    }

    #[tokio::test]
    async fn test_undeliverable_queued_publish_is_reported() {
        let relay = MemoryRelay::new();
        let heartbeat = Heartbeat::new(Duration::from_secs(5));
        let client = relay.client();
        let relayer = relayer(client.clone(), &heartbeat).await;
        let mut events = relayer.events();

        client.simulate_disconnect();
        relayer
            .publish("topic-b", "queued", PublishOptions::default())
            .await
            .unwrap();
        client.fail_next_publishes(3);
        client.simulate_reconnect();

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(RelayerEvent::PublishFailed { topic, error }) = events.recv().await {
                    return (topic, error);
                }
            }
        })
        .await
        .expect("publish failure event");
        assert_eq!(failed.0, "topic-b");
        assert!(matches!(failed.1, RelayerError::PublishFailure { attempts: 3, .. }));
        assert_eq!(relayer.publisher().queue_len(), 0);
        assert!(client.published().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_recovers_disabled_subscriber() {
        let relay = MemoryRelay::new();
        let heartbeat = Heartbeat::new(Duration::from_secs(5));
        let relayer = relayer(relay.client(), &heartbeat).await;
        relayer.subscribe("t").await.unwrap();

        relayer.subscriber().on_disconnect();
        assert!(!relayer.subscriber().is_enabled());

        let mut sub_events = relayer.subscriber().subscribe_events();
        heartbeat.pulse();
        loop {
            if next_subscriber_event(&mut sub_events).await == SubscriberEvent::Enabled {
                break;
            }
        }
        assert!(relayer.subscriber().is_subscribed("t"));
    }
}
