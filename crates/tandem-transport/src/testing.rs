//! In-memory relay for tests and local demos.
//!
//! `MemoryRelay` models the relay semantics the client depends on:
//! - Messages are delivered to every other connected subscriber of a topic
//! - Messages published to a topic with no other subscriber are retained in
//!   a per-topic mailbox and delivered on the next subscribe
//! - A dropped socket loses all of its relay-side subscriptions
//! - Every subscribe gets a fresh id, including resubscriptions

use crate::protocol::{RelayRequest, RelayResponse};
use crate::traits::{RelayMessage, RelayTransport, TransportError, TransportEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

struct ClientSlot {
    events: broadcast::Sender<TransportEvent>,
    connected: bool,
}

struct Retained {
    sender: u64,
    message: String,
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<u64, ClientSlot>,
    /// topic -> (subscription id, client id)
    subscriptions: HashMap<String, Vec<(String, u64)>>,
    mailboxes: HashMap<String, VecDeque<Retained>>,
    next_client: u64,
    next_subscription: u64,
}

impl RelayState {
    fn deliver(&self, client: u64, topic: &str, message: &str) {
        if let Some(slot) = self.clients.get(&client) {
            let _ = slot.events.send(TransportEvent::Message(RelayMessage {
                topic: topic.to_string(),
                message: message.to_string(),
            }));
        }
    }

    fn publish(&mut self, sender: u64, topic: &str, message: &str) {
        let mut recipients: Vec<u64> = self
            .subscriptions
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .map(|(_, client)| *client)
                    .filter(|client| *client != sender)
                    .filter(|client| self.clients.get(client).map(|c| c.connected).unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        recipients.sort_unstable();
        recipients.dedup();

        if recipients.is_empty() {
            self.mailboxes
                .entry(topic.to_string())
                .or_default()
                .push_back(Retained {
                    sender,
                    message: message.to_string(),
                });
            return;
        }
        for client in recipients {
            self.deliver(client, topic, message);
        }
    }

    fn subscribe(&mut self, client: u64, topic: &str) -> String {
        self.next_subscription += 1;
        let id = format!("sub-{:08x}-{:04x}", self.next_subscription, client);
        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .push((id.clone(), client));

        // Flush retained messages from other senders to the new subscriber.
        if let Some(mailbox) = self.mailboxes.remove(topic) {
            let mut keep = VecDeque::new();
            for retained in mailbox {
                if retained.sender == client {
                    keep.push_back(retained);
                } else {
                    self.deliver(client, topic, &retained.message);
                }
            }
            if !keep.is_empty() {
                self.mailboxes.insert(topic.to_string(), keep);
            }
        }
        id
    }

    fn unsubscribe(&mut self, client: u64, topic: &str, id: &str) {
        if let Some(subs) = self.subscriptions.get_mut(topic) {
            subs.retain(|(sub_id, owner)| !(sub_id == id && *owner == client));
            if subs.is_empty() {
                self.subscriptions.remove(topic);
            }
        }
    }

    fn drop_client_subscriptions(&mut self, client: u64) {
        for subs in self.subscriptions.values_mut() {
            subs.retain(|(_, owner)| *owner != client);
        }
        self.subscriptions.retain(|_, subs| !subs.is_empty());
    }
}

/// Shared in-process relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, not yet connected, client socket.
    pub fn client(&self) -> Arc<MemoryRelayClient> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut state = self.state.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(
            id,
            ClientSlot {
                events: events.clone(),
                connected: false,
            },
        );
        Arc::new(MemoryRelayClient {
            id,
            relay: self.clone(),
            events,
            connected: AtomicBool::new(false),
            fail_requests: AtomicU32::new(0),
            fail_publishes: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Number of live relay-side subscriptions for the topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of retained, undelivered messages for the topic.
    pub fn retained_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .mailboxes
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// One client socket on a [`MemoryRelay`].
pub struct MemoryRelayClient {
    id: u64,
    relay: MemoryRelay,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    fail_requests: AtomicU32,
    fail_publishes: AtomicU32,
    requests: Mutex<Vec<RelayRequest>>,
}

impl MemoryRelayClient {
    /// Simulate the socket dropping. The relay forgets our subscriptions.
    pub fn simulate_disconnect(&self) {
        self.set_connected(false);
        self.relay.state.lock().drop_client_subscriptions(self.id);
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    /// Simulate the socket coming back.
    pub fn simulate_reconnect(&self) {
        self.set_connected(true);
        let _ = self.events.send(TransportEvent::Connected);
    }

    /// Make the next `n` requests fail with `TransportError::Timeout`
    /// as if the acknowledgement was lost.
    pub fn fail_next_requests(&self, n: u32) {
        self.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Like [`fail_next_requests`](Self::fail_next_requests), but only
    /// publishes are affected. Subscribes and unsubscribes go through.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Every request that reached the relay, in order.
    pub fn requests(&self) -> Vec<RelayRequest> {
        self.requests.lock().clone()
    }

    /// Published frames only.
    pub fn published(&self) -> Vec<RelayRequest> {
        self.requests()
            .into_iter()
            .filter(|r| matches!(r, RelayRequest::Publish { .. }))
            .collect()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if let Some(slot) = self.relay.state.lock().clients.get_mut(&self.id) {
            slot.connected = connected;
        }
    }
}

fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RelayTransport for MemoryRelayClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.simulate_reconnect();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            self.simulate_disconnect();
        }
        Ok(())
    }

    async fn request(&self, request: RelayRequest) -> Result<RelayResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let should_fail = take_one(&self.fail_requests)
            || (matches!(request, RelayRequest::Publish { .. }) && take_one(&self.fail_publishes));
        if should_fail {
            return Err(TransportError::Timeout);
        }

        self.requests.lock().push(request.clone());

        let mut state = self.relay.state.lock();
        let response = match request {
            RelayRequest::Publish { topic, message, .. } => {
                state.publish(self.id, &topic, &message);
                RelayResponse::Ack(true)
            }
            RelayRequest::Subscribe { topic } => RelayResponse::Subscribed {
                id: state.subscribe(self.id, &topic),
            },
            RelayRequest::Unsubscribe { topic, id } => {
                state.unsubscribe(self.id, &topic, &id);
                RelayResponse::Ack(true)
            }
        };
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PublishOptions;

    async fn subscribe(client: &MemoryRelayClient, topic: &str) -> String {
        let resp = client
            .request(RelayRequest::Subscribe {
                topic: topic.into(),
            })
            .await
            .unwrap();
        resp.subscription_id().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers() {
        let relay = MemoryRelay::new();
        let alice = relay.client();
        let bob = relay.client();
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();

        let mut bob_events = bob.events();
        subscribe(&bob, "t1").await;
        subscribe(&alice, "t1").await;

        alice
            .request(RelayRequest::publish("t1", "hello", &PublishOptions::default()))
            .await
            .unwrap();

        assert_eq!(
            bob_events.recv().await.unwrap(),
            TransportEvent::Message(RelayMessage {
                topic: "t1".into(),
                message: "hello".into()
            })
        );
        assert_eq!(relay.retained_count("t1"), 0);
    }

    #[tokio::test]
    async fn test_mailbox_delivers_on_subscribe() {
        let relay = MemoryRelay::new();
        let alice = relay.client();
        let bob = relay.client();
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        let mut bob_events = bob.events();

        alice
            .request(RelayRequest::publish("t2", "early", &PublishOptions::default()))
            .await
            .unwrap();
        assert_eq!(relay.retained_count("t2"), 1);

        subscribe(&bob, "t2").await;
        match bob_events.recv().await.unwrap() {
            TransportEvent::Message(msg) => assert_eq!(msg.message, "early"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(relay.retained_count("t2"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_drops_relay_subscriptions() {
        let relay = MemoryRelay::new();
        let alice = relay.client();
        alice.connect().await.unwrap();

        let first = subscribe(&alice, "t3").await;
        assert_eq!(relay.subscriber_count("t3"), 1);

        alice.simulate_disconnect();
        assert_eq!(relay.subscriber_count("t3"), 0);
        assert_eq!(
            alice.request(RelayRequest::Subscribe { topic: "t3".into() }).await,
            Err(TransportError::Disconnected)
        );

        alice.simulate_reconnect();
        let second = subscribe(&alice, "t3").await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let relay = MemoryRelay::new();
        let alice = relay.client();
        alice.connect().await.unwrap();
        alice.fail_next_requests(2);

        let req = RelayRequest::publish("t4", "m", &PublishOptions::default());
        assert_eq!(alice.request(req.clone()).await, Err(TransportError::Timeout));
        assert_eq!(alice.request(req.clone()).await, Err(TransportError::Timeout));
        assert!(alice.request(req).await.is_ok());
        assert_eq!(alice.published().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failures_spare_subscribes() {
        let relay = MemoryRelay::new();
        let alice = relay.client();
        alice.connect().await.unwrap();
        alice.fail_next_publishes(1);

        subscribe(&alice, "t5").await;
        let req = RelayRequest::publish("t5", "m", &PublishOptions::default());
        assert_eq!(alice.request(req.clone()).await, Err(TransportError::Timeout));
        assert!(alice.request(req).await.is_ok());
        assert_eq!(alice.published().len(), 1);
    }
}
