//! End-to-end tests: two clients talking through an in-memory relay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use tandem_core::client::{Client, ClientDeps};
use tandem_core::clock::ManualClock;
use tandem_core::errors::{codes, RelayerError, SequenceError};
use tandem_core::expirer::ExpiryTarget;
use tandem_core::harness::*;
use tandem_core::jsonrpc::{ErrorObject, JsonRpcResponse, RequestArguments};
use tandem_core::relayer::RelayerEvent;
use tandem_core::sequence::*;
use tandem_core::storage::MemoryStorage;
use tandem_core::{ClientError, Reason};
use tandem_crypto::{Crypto, CryptoError, KeyChain, KeyHandle};
use tandem_transport::{MemoryRelay, PublishOptions, RelayRequest, RelayTransport};

const DAY: u64 = 24 * 60 * 60;

fn wallet_permissions() -> Capabilities {
    Capabilities::methods(["eth_sign", "personal_sign"])
        .with_chains(["eip155:1"])
        .with_notifications(["accountsChanged"])
}

struct Setup {
    relay: MemoryRelay,
    clock: Arc<ManualClock>,
    dapp: TestPeer,
    wallet: TestPeer,
    pairing: String,
    session: String,
}

async fn setup() -> Setup {
    let relay = MemoryRelay::new();
    let clock = Arc::new(ManualClock::new(EPOCH));
    let (dapp, wallet) = dapp_and_wallet(&relay, clock.clone()).await.unwrap();
    let (pairing, session) = pair_and_connect(&dapp.client, &wallet.client, wallet_permissions())
        .await
        .unwrap();
    Setup {
        relay,
        clock,
        dapp,
        wallet,
        pairing,
        session,
    }
}

fn sign_request() -> RequestArguments {
    RequestArguments {
        method: "eth_sign".into(),
        params: json!(["0xabc", "0xdeadbeef"]),
    }
}

fn accounts_changed(n: u64) -> Notification {
    Notification {
        kind: "accountsChanged".into(),
        data: json!({ "n": n }),
    }
}

async fn wait_relayer<F>(events: &mut broadcast::Receiver<RelayerEvent>, pred: F)
where
    F: Fn(&RelayerEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            if let Ok(event) = events.recv().await {
                if pred(&event) {
                    return;
                }
            }
        }
    })
    .await
    .expect("relayer event");
}

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Keychain that stops deriving shared keys after a fixed budget.
struct LimitedKeyChain {
    inner: KeyChain,
    shared_keys_left: AtomicU32,
}

impl LimitedKeyChain {
    fn new(shared_keys: u32) -> Self {
        Self {
            inner: KeyChain::new(),
            shared_keys_left: AtomicU32::new(shared_keys),
        }
    }
}

impl Crypto for LimitedKeyChain {
    fn generate_key_pair(&self) -> Result<String, CryptoError> {
        self.inner.generate_key_pair()
    }

    fn generate_sym_key(&self) -> Result<(KeyHandle, String), CryptoError> {
        self.inner.generate_sym_key()
    }

    fn set_sym_key(&self, sym_key: &str) -> Result<KeyHandle, CryptoError> {
        self.inner.set_sym_key(sym_key)
    }

    fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
    ) -> Result<KeyHandle, CryptoError> {
        self.shared_keys_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| CryptoError::Derivation)?;
        self.inner.generate_shared_key(self_public_key, peer_public_key)
    }

    fn has_key(&self, topic: &str) -> bool {
        self.inner.has_key(topic)
    }

    fn encode(&self, topic: &str, payload: &str) -> Result<String, CryptoError> {
        self.inner.encode(topic, payload)
    }

    fn decode(&self, topic: &str, encoded: &str) -> Result<String, CryptoError> {
        self.inner.decode(topic, encoded)
    }

    fn delete_key(&self, topic: &str) -> Result<(), CryptoError> {
        self.inner.delete_key(topic)
    }

    fn delete_key_pair(&self, public_key: &str) -> Result<(), CryptoError> {
        self.inner.delete_key_pair(public_key)
    }
}

#[tokio::test]
async fn test_pairing_and_session_settle_on_both_sides() {
    let s = setup().await;

    let dapp_session = s.dapp.client.session().get(&s.session).unwrap();
    let wallet_session = s.wallet.client.session().get(&s.session).unwrap();
    assert!(wallet_session.is_controller());
    assert!(dapp_session.peer_is_controller());
    assert_eq!(dapp_session.permissions, wallet_session.permissions);
    assert_eq!(dapp_session.expiry, EPOCH + 7 * DAY);
    assert!(dapp_session.permissions.allows_method("eth_sign"));

    // Proposal topics are gone once settled.
    assert!(s.dapp.client.session().pending().is_empty());
    assert!(s.wallet.client.session().pending().is_empty());
    assert_eq!(s.relay.subscriber_count(&s.session), 2);
    assert!(s.dapp.client.pairing().get(&s.pairing).is_ok());

    let found = s.dapp.client.session().find(&Capabilities::methods(["eth_sign"]));
    assert_eq!(found.len(), 1);
    assert!(s
        .dapp
        .client
        .session()
        .find(&Capabilities::methods(["eth_sendTransaction"]))
        .is_empty());
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();
    let wallet_session = s.wallet.client.session().clone();

    let responder = tokio::spawn(async move {
        let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Request { .. }))
            .await
            .unwrap();
        let SequenceEvent::Request {
            topic,
            request,
            chain_id,
        } = event
        else {
            panic!("expected request");
        };
        assert_eq!(request.method, "eth_sign");
        assert_eq!(request.params, sign_request().params);
        assert_eq!(chain_id.as_deref(), Some("eip155:1"));
        wallet_session
            .reply(&topic, JsonRpcResponse::result(request.id, json!("0xsignature")))
            .await
            .unwrap();
    });

    let result = s
        .dapp
        .client
        .session()
        .request(&s.session, sign_request(), Some("eip155:1".into()), None)
        .await
        .unwrap();
    assert_eq!(result, json!("0xsignature"));
    responder.await.unwrap();

    let record = s
        .dapp
        .client
        .history()
        .values()
        .into_iter()
        .find(|r| r.request.method == "eth_sign")
        .unwrap();
    assert!(record.is_resolved());
    assert_eq!(record.chain_id.as_deref(), Some("eip155:1"));
}

#[tokio::test]
async fn test_error_reply_surfaces_as_peer_error() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();
    let wallet_session = s.wallet.client.session().clone();

    tokio::spawn(async move {
        if let Ok(SequenceEvent::Request { topic, request, .. }) =
            next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Request { .. })).await
        {
            let error = ErrorObject {
                code: codes::USER_REJECTED,
                message: "User rejected the request".into(),
            };
            let _ = wallet_session
                .reply(&topic, JsonRpcResponse::error(request.id, error))
                .await;
        }
    });

    let err = s
        .dapp
        .client
        .session()
        .request(&s.session, sign_request(), None, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SequenceError::Peer {
            code: codes::USER_REJECTED,
            message: "User rejected the request".into(),
        }
    );
}

#[tokio::test]
async fn test_permissions_enforced_before_sending() {
    let s = setup().await;
    let session = s.dapp.client.session();

    let err = session
        .request(
            &s.session,
            RequestArguments {
                method: "eth_sendTransaction".into(),
                params: json!([]),
            },
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::UnauthorizedTarget(_)));
    assert_eq!(err.code(), codes::UNAUTHORIZED_TARGET);

    let err = session
        .request(&s.session, sign_request(), Some("eip155:5".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::UnauthorizedTarget(_)));

    let err = session
        .notify(
            &s.session,
            Notification {
                kind: "chainChanged".into(),
                data: json!(null),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::UnauthorizedTarget(_)));

    // Only the wallet controls the session.
    let err = session
        .update(&s.session, SequenceState::new().with("accounts", json!([])))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::Unauthorized(_)));
    let err = session
        .upgrade(&s.session, Capabilities::methods(["eth_sendTransaction"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::Unauthorized(_)));
    let err = session.extend(&s.session, EPOCH + 30 * DAY).await.unwrap_err();
    assert!(matches!(err, SequenceError::Unauthorized(_)));
}

#[tokio::test]
async fn test_update_merges_state_on_peer() {
    let s = setup().await;
    let mut dapp_events = s.dapp.client.session().subscribe();

    s.wallet
        .client
        .session()
        .update(
            &s.session,
            SequenceState::new()
                .with("accounts", json!(["eip155:1:0x1"]))
                .with("label", json!("main")),
        )
        .await
        .unwrap();
    s.wallet
        .client
        .session()
        .update(&s.session, SequenceState::new().with("label", json!("spare")))
        .await
        .unwrap();

    next_event(&mut dapp_events, |e| {
        matches!(e, SequenceEvent::Updated(s) if s.state.get("label") == Some(&json!("spare")))
    })
    .await
    .unwrap();
    let state = s.dapp.client.session().get(&s.session).unwrap().state;
    assert_eq!(state.get("accounts"), Some(&json!(["eip155:1:0x1"])));
    assert_eq!(state, s.wallet.client.session().get(&s.session).unwrap().state);
}

#[tokio::test]
async fn test_upgrade_is_idempotent_and_reaches_peer() {
    let s = setup().await;
    let mut dapp_events = s.dapp.client.session().subscribe();
    let extra = Capabilities::methods(["eth_signTypedData"]).with_chains(["eip155:137"]);

    let first = s.wallet.client.session().upgrade(&s.session, extra.clone()).await.unwrap();
    let second = s.wallet.client.session().upgrade(&s.session, extra).await.unwrap();
    assert_eq!(first.permissions, second.permissions);
    assert!(second.permissions.allows_method("eth_sign"));
    assert!(second.permissions.allows_chain("eip155:137"));

    next_event(&mut dapp_events, |e| matches!(e, SequenceEvent::Upgraded(_)))
        .await
        .unwrap();
    next_event(&mut dapp_events, |e| matches!(e, SequenceEvent::Upgraded(_)))
        .await
        .unwrap();
    assert_eq!(
        s.dapp.client.session().get(&s.session).unwrap().permissions,
        second.permissions
    );
}

#[tokio::test]
async fn test_extend_moves_expiry_forward_only() {
    let s = setup().await;
    let mut dapp_events = s.dapp.client.session().subscribe();
    let current = s.wallet.client.session().get(&s.session).unwrap().expiry;

    let err = s
        .wallet
        .client
        .session()
        .extend(&s.session, current)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SequenceError::InvalidExtendRequest {
            current,
            requested: current,
        }
    );
    assert_eq!(err.code(), codes::INVALID_EXTEND_REQUEST);

    let extended = s
        .wallet
        .client
        .session()
        .extend(&s.session, current + DAY)
        .await
        .unwrap();
    assert_eq!(extended.expiry, current + DAY);

    next_event(&mut dapp_events, |e| matches!(e, SequenceEvent::Extended(_)))
        .await
        .unwrap();
    assert_eq!(s.dapp.client.session().get(&s.session).unwrap().expiry, current + DAY);
    let target = ExpiryTarget::Topic(s.session.clone());
    assert_eq!(s.dapp.client.expirer().get(&target).unwrap().expiry, current + DAY);
    assert_eq!(s.wallet.client.expirer().get(&target).unwrap().expiry, current + DAY);
}

#[tokio::test]
async fn test_delete_tears_down_both_sides() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();

    s.dapp
        .client
        .session()
        .delete(&s.session, Reason::user_disconnected())
        .await
        .unwrap();

    let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Deleted { .. }))
        .await
        .unwrap();
    let SequenceEvent::Deleted { topic, reason } = event else {
        panic!("expected delete");
    };
    assert_eq!(topic, s.session);
    assert_eq!(reason.code, codes::USER_DISCONNECTED);

    for client in [&s.dapp.client, &s.wallet.client] {
        assert!(matches!(
            client.session().get(&s.session),
            Err(SequenceError::NotFound { .. })
        ));
        assert!(client.history().values().iter().all(|r| r.topic != s.session));
        assert!(!client.expirer().has(&ExpiryTarget::Topic(s.session.clone())));
        assert!(!client.relayer().subscriber().is_subscribed(&s.session));
    }
    assert_eq!(s.relay.subscriber_count(&s.session), 0);
    // The pairing outlives its sessions.
    assert!(s.wallet.client.pairing().get(&s.pairing).is_ok());

    let err = s
        .dapp
        .client
        .session()
        .delete(&s.session, Reason::user_disconnected())
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::NotFound { .. }));
}

#[tokio::test]
async fn test_settled_session_expires_within_a_pulse() {
    let s = setup().await;
    let mut dapp_events = s.dapp.client.session().subscribe();
    let mut wallet_events = s.wallet.client.session().subscribe();

    s.clock.advance(7 * DAY + 1);

    for events in [&mut dapp_events, &mut wallet_events] {
        let event = next_event(events, |e| matches!(e, SequenceEvent::Deleted { .. }))
            .await
            .unwrap();
        let SequenceEvent::Deleted { reason, .. } = event else {
            panic!("expected delete");
        };
        assert_eq!(reason.code, codes::EXPIRED);
    }
    assert!(s.dapp.client.session().get(&s.session).is_err());
    assert!(s.dapp.client.pairing().get(&s.pairing).is_ok());
}

#[tokio::test]
async fn test_pending_proposal_expires() {
    let relay = MemoryRelay::new();
    let clock = Arc::new(ManualClock::new(EPOCH));
    let (dapp, _wallet) = dapp_and_wallet(&relay, clock.clone()).await.unwrap();
    let mut events = dapp.client.pairing().subscribe();

    let pending = dapp
        .client
        .pairing()
        .propose(ProposeParams {
            ttl: Some(300),
            ..ProposeParams::default()
        })
        .await
        .unwrap();
    clock.advance(301);

    next_event(&mut events, |e| {
        matches!(e, SequenceEvent::Deleted { reason, .. } if reason.code == codes::EXPIRED)
    })
    .await
    .unwrap();
    assert!(dapp.client.pairing().pending().is_empty());
    assert!(!dapp.crypto.has_key(&pending.topic));
}

#[tokio::test]
async fn test_rejected_pairing_is_removed_on_both_sides() {
    let relay = MemoryRelay::new();
    let clock = Arc::new(ManualClock::new(EPOCH));
    let (dapp, wallet) = dapp_and_wallet(&relay, clock).await.unwrap();
    let mut dapp_events = dapp.client.pairing().subscribe();

    let pending = dapp.client.pairing().propose(ProposeParams::default()).await.unwrap();
    let Signal::Uri { uri } = &pending.proposal.signal else {
        panic!("pairing proposals carry a uri");
    };
    let received = wallet.client.pair(uri).await.unwrap();
    assert_eq!(received.topic, pending.topic);

    let responded = wallet
        .client
        .pairing()
        .respond(RespondParams::reject(received.proposal, Reason::user_rejected()))
        .await
        .unwrap();
    assert!(matches!(responded.outcome, Some(Outcome::Rejected { .. })));

    let event = next_event(&mut dapp_events, |e| matches!(e, SequenceEvent::Deleted { .. }))
        .await
        .unwrap();
    let SequenceEvent::Deleted { reason, .. } = event else {
        panic!("expected delete");
    };
    assert_eq!(reason.code, codes::USER_REJECTED);
    assert!(dapp.client.pairing().pending().is_empty());
    assert!(wallet.client.pairing().pending().is_empty());
    assert!(!dapp.crypto.has_key(&pending.topic));
    assert!(!wallet.crypto.has_key(&pending.topic));
}

#[tokio::test]
async fn test_respond_requires_exactly_one_controller() {
    let relay = MemoryRelay::new();
    let clock = Arc::new(ManualClock::new(EPOCH));
    let dapp = spawn_peer(&relay, test_config("dapp", false), clock.clone()).await.unwrap();
    let other = spawn_peer(&relay, test_config("other", false), clock).await.unwrap();

    let pending = dapp.client.pairing().propose(ProposeParams::default()).await.unwrap();
    let Signal::Uri { uri } = &pending.proposal.signal else {
        panic!("pairing proposals carry a uri");
    };
    let received = other.client.pair(uri).await.unwrap();
    let err = other
        .client
        .pairing()
        .respond(RespondParams::approve(received.proposal.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::InvalidParams(_)));

    // A second response to the same proposal is refused.
    other
        .client
        .pairing()
        .respond(RespondParams::reject(received.proposal.clone(), Reason::user_rejected()))
        .await
        .unwrap();
    let err = other
        .client
        .pairing()
        .respond(RespondParams::approve(received.proposal))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::NotFound { .. }));
}

#[tokio::test]
async fn test_session_needs_settled_pairing() {
    let relay = MemoryRelay::new();
    let clock = Arc::new(ManualClock::new(EPOCH));
    let (dapp, _wallet) = dapp_and_wallet(&relay, clock).await.unwrap();

    let err = dapp
        .client
        .connect(&"00".repeat(32), ProposeParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Sequence(SequenceError::NotFound { .. })
    ));

    let err = dapp
        .client
        .session()
        .propose(ProposeParams {
            signal: Some(Signal::Uri { uri: "tandem:x@1".into() }),
            ..ProposeParams::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::UnsupportedSignal { .. }));

    assert!(matches!(
        dapp.client.pair("http://example.com").await,
        Err(ClientError::Uri(_))
    ));
}

#[tokio::test]
async fn test_ping_times_out_while_peer_offline() {
    let s = setup().await;
    s.dapp.client.session().ping(&s.session, None).await.unwrap();

    s.wallet.transport.simulate_disconnect();
    let err = s
        .dapp
        .client
        .session()
        .ping(&s.session, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::Timeout { .. }));
    assert_eq!(err.code(), codes::TIMEOUT);
    // The relay holds the ping for the absent peer.
    assert_eq!(s.relay.retained_count(&s.session), 1);
}

#[tokio::test]
async fn test_reconnect_resubscribes_with_new_ids() {
    let s = setup().await;
    let relayer = s.wallet.client.relayer();
    let before = relayer.subscriber().topic_map()[&s.session].clone();
    let mut events = relayer.events();

    s.wallet.transport.simulate_disconnect();
    wait_relayer(&mut events, |e| matches!(e, RelayerEvent::Disconnected)).await;
    assert!(!relayer.subscriber().is_subscribed(&s.session));

    s.wallet.transport.simulate_reconnect();
    wait_relayer(&mut events, |e| matches!(e, RelayerEvent::Connected)).await;

    let after = relayer.subscriber().topic_map()[&s.session].clone();
    assert_eq!(after.len(), 1);
    assert_ne!(before, after);
    assert!(relayer.reconnects() >= 1);

    s.dapp.client.session().ping(&s.session, None).await.unwrap();
}

#[tokio::test]
async fn test_publish_queued_while_disconnected() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();
    let mut dapp_relay = s.dapp.client.relayer().events();

    s.dapp.transport.simulate_disconnect();
    s.dapp
        .client
        .session()
        .notify(&s.session, accounts_changed(1))
        .await
        .unwrap();
    assert_eq!(s.dapp.client.relayer().publisher().queue_len(), 1);

    s.dapp.transport.simulate_reconnect();
    wait_relayer(&mut dapp_relay, |e| matches!(e, RelayerEvent::Connected)).await;

    let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Notification { .. }))
        .await
        .unwrap();
    let SequenceEvent::Notification { notification, .. } = event else {
        panic!("expected notification");
    };
    assert_eq!(notification, accounts_changed(1));
    assert_eq!(s.dapp.client.relayer().publisher().queue_len(), 0);
}

#[tokio::test]
async fn test_transient_publish_failures_are_retried() {
    let s = setup().await;

    s.dapp.transport.fail_next_requests(2);
    s.dapp.client.session().ping(&s.session, None).await.unwrap();

    s.dapp.transport.fail_next_requests(10);
    let err = s
        .dapp
        .client
        .session()
        .ping(&s.session, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SequenceError::Relayer(RelayerError::PublishFailure { attempts: 3, .. })
    ));
    s.dapp.transport.fail_next_requests(0);
}

#[tokio::test]
async fn test_duplicate_messages_are_dropped() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();

    s.dapp
        .client
        .session()
        .notify(&s.session, accounts_changed(1))
        .await
        .unwrap();
    next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Notification { .. }))
        .await
        .unwrap();

    let frame = s
        .dapp
        .transport
        .published()
        .into_iter()
        .rev()
        .find_map(|r| match r {
            RelayRequest::Publish { topic, message, .. } if topic == s.session => Some(message),
            _ => None,
        })
        .unwrap();
    let replayer = s.relay.client();
    replayer.connect().await.unwrap();
    replayer
        .request(RelayRequest::publish(&s.session, &frame, &PublishOptions::default()))
        .await
        .unwrap();

    s.dapp
        .client
        .session()
        .notify(&s.session, accounts_changed(2))
        .await
        .unwrap();
    let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Notification { .. }))
        .await
        .unwrap();
    let SequenceEvent::Notification { notification, .. } = event else {
        panic!("expected notification");
    };
    assert_eq!(notification, accounts_changed(2));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let s = setup().await;
    s.wallet.client.shutdown().await.unwrap();
    assert_eq!(s.relay.subscriber_count(&s.session), 1);

    let restarted = Client::init(
        test_config("wallet", true),
        ClientDeps {
            crypto: s.wallet.crypto.clone(),
            storage: s.wallet.storage.clone(),
            transport: s.relay.client(),
            clock: s.clock.clone(),
        },
    )
    .await
    .unwrap();

    let session = restarted.session().get(&s.session).unwrap();
    assert!(session.is_controller());
    assert!(restarted.pairing().get(&s.pairing).is_ok());
    assert!(restarted.relayer().subscriber().is_subscribed(&s.session));
    assert!(restarted
        .expirer()
        .has(&ExpiryTarget::Topic(s.session.clone())));
    assert_eq!(s.relay.subscriber_count(&s.session), 2);

    s.dapp.client.session().ping(&s.session, None).await.unwrap();
}

#[tokio::test]
async fn test_storage_failure_surfaces() {
    let s = setup().await;
    s.wallet.storage.set_fail_writes(true);

    let err = s
        .wallet
        .client
        .session()
        .update(&s.session, SequenceState::new().with("k", json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::Store(_)));
    s.wallet.storage.set_fail_writes(false);
}

#[tokio::test]
async fn test_late_response_is_still_recorded() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();

    let err = s
        .dapp
        .client
        .session()
        .request(&s.session, sign_request(), None, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::Timeout { .. }));

    let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Request { .. }))
        .await
        .unwrap();
    let SequenceEvent::Request { topic, request, .. } = event else {
        panic!("expected request");
    };

    // Let the request id expire and a few sweeps pass.
    s.clock.advance(60);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let history = s.dapp.client.history();
    assert!(history.exists(&s.session, request.id));

    s.wallet
        .client
        .session()
        .reply(&topic, JsonRpcResponse::result(request.id, json!("0xlate")))
        .await
        .unwrap();
    eventually(|| {
        history
            .get(&s.session, request.id)
            .map(|r| r.is_resolved())
            .unwrap_or(false)
    })
    .await;
    assert!(!s
        .dapp
        .client
        .expirer()
        .has(&ExpiryTarget::Id(request.id)));
}

#[tokio::test]
async fn test_new_publish_waits_behind_queued_ones() {
    let s = setup().await;
    let mut wallet_events = s.wallet.client.session().subscribe();
    let session = s.dapp.client.session();

    s.dapp.transport.simulate_disconnect();
    session.notify(&s.session, accounts_changed(1)).await.unwrap();
    s.dapp.transport.simulate_reconnect();
    session.notify(&s.session, accounts_changed(2)).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Notification { .. }))
            .await
            .unwrap();
        let SequenceEvent::Notification { notification, .. } = event else {
            panic!("expected notification");
        };
        received.push(notification);
    }
    assert_eq!(received, vec![accounts_changed(1), accounts_changed(2)]);
}

#[tokio::test]
async fn test_failed_settlement_leaves_nothing_behind() {
    let relay = MemoryRelay::new();
    let clock = Arc::new(ManualClock::new(EPOCH));
    let dapp = spawn_peer(&relay, test_config("dapp", false), clock.clone())
        .await
        .unwrap();
    // Enough to approve, not enough to settle.
    let crypto = Arc::new(LimitedKeyChain::new(1));
    let wallet = Client::init(
        test_config("wallet", true),
        ClientDeps {
            crypto: crypto.clone(),
            storage: Arc::new(MemoryStorage::new()),
            transport: relay.client(),
            clock,
        },
    )
    .await
    .unwrap();
    let mut wallet_events = wallet.pairing().subscribe();

    let pending = dapp.client.pairing().propose(ProposeParams::default()).await.unwrap();
    let Signal::Uri { uri } = &pending.proposal.signal else {
        panic!("pairing proposals carry a uri");
    };
    let received = wallet.pair(uri).await.unwrap();
    let responded = wallet
        .pairing()
        .respond(RespondParams::approve(received.proposal))
        .await
        .unwrap();
    let Some(Outcome::Responded(approval)) = responded.outcome else {
        panic!("expected approval");
    };
    assert!(crypto.has_key(&approval.topic));

    let event = next_event(&mut wallet_events, |e| matches!(e, SequenceEvent::Deleted { .. }))
        .await
        .unwrap();
    let SequenceEvent::Deleted { topic, reason } = event else {
        panic!("expected delete");
    };
    assert_eq!(topic, pending.topic);
    assert_eq!(reason.code, codes::SETTLE_FAILED);

    let pairing = wallet.pairing();
    assert!(pairing.pending().is_empty());
    assert!(pairing.get(&approval.topic).is_err());
    for topic in [&pending.topic, &approval.topic] {
        assert!(!wallet.relayer().subscriber().is_subscribed(topic));
        assert!(!wallet.expirer().has(&ExpiryTarget::Topic(topic.clone())));
        assert!(!crypto.has_key(topic));
    }
    assert_eq!(crypto.inner.key_pair_count(), 0);
}

#[tokio::test]
async fn test_undelivered_session_proposal_is_withdrawn() {
    let s = setup().await;
    let client = &s.dapp.client;
    let topics = client.relayer().subscriber().topics();
    let sym_keys = s.dapp.crypto.sym_key_count();
    let key_pairs = s.dapp.crypto.key_pair_count();
    let expirations = client.expirer().len();
    let open_requests = client.history().pending().len();

    s.dapp.transport.fail_next_publishes(10);
    let err = client
        .connect(
            &s.pairing,
            ProposeParams {
                permissions: wallet_permissions(),
                ..ProposeParams::default()
            },
        )
        .await
        .unwrap_err();
    s.dapp.transport.fail_next_publishes(0);

    assert!(matches!(
        err,
        ClientError::Sequence(SequenceError::Relayer(RelayerError::PublishFailure { .. }))
    ));
    assert!(client.session().pending().is_empty());
    assert_eq!(client.relayer().subscriber().topics(), topics);
    assert_eq!(s.dapp.crypto.sym_key_count(), sym_keys);
    assert_eq!(s.dapp.crypto.key_pair_count(), key_pairs);
    assert_eq!(client.expirer().len(), expirations);
    assert_eq!(client.history().pending().len(), open_requests);
}

#[tokio::test]
async fn test_topic_operations_serialize_against_delete() {
    let s = setup().await;
    let session = s.wallet.client.session();

    let (updated, deleted) = tokio::join!(
        session.update(&s.session, SequenceState::new().with("k", json!(1))),
        session.delete(&s.session, Reason::user_disconnected()),
    );
    updated.unwrap();
    deleted.unwrap();
    assert!(matches!(session.get(&s.session), Err(SequenceError::NotFound { .. })));

    let (deleted, extended) = tokio::join!(
        s.dapp.client.pairing().delete(&s.pairing, Reason::user_disconnected()),
        s.dapp.client.pairing().extend(&s.pairing, EPOCH + 60 * DAY),
    );
    deleted.unwrap();
    assert!(matches!(extended, Err(SequenceError::NotFound { .. })));
    assert!(matches!(
        s.dapp.client.pairing().get(&s.pairing),
        Err(SequenceError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_failed_init_leaves_no_tasks_behind() {
    let s = setup().await;
    s.wallet.client.shutdown().await.unwrap();
    // Aborted tasks release their handles once the runtime polls them.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let storage_refs = Arc::strong_count(&s.wallet.storage);

    let transport = s.relay.client();
    transport.fail_next_requests(100);
    let result = Client::init(
        test_config("wallet", true),
        ClientDeps {
            crypto: s.wallet.crypto.clone(),
            storage: s.wallet.storage.clone(),
            transport: transport.clone(),
            clock: s.clock.clone(),
        },
    )
    .await;
    transport.fail_next_requests(0);

    assert!(matches!(result, Err(ClientError::Relayer(_))));
    assert_eq!(Arc::strong_count(&s.wallet.storage), storage_refs);
    assert!(!transport.is_connected());
}
