//! Test harness for Tandem core functionality.
//!
//! Builds clients on a shared [`MemoryRelay`] and drives the pairing and
//! session handshakes end-to-end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::broadcast::{self, error::RecvError};

use tandem_crypto::KeyChain;
use tandem_transport::{MemoryRelay, MemoryRelayClient};

use crate::client::{Client, ClientDeps};
use crate::clock::ManualClock;
use crate::config::ClientConfig;
use crate::sequence::{
    Capabilities, ProposeParams, RespondParams, SequenceEvent, Signal,
};
use crate::storage::MemoryStorage;

/// Upper bound for any single awaited event in tests.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed start time for manual clocks.
pub const EPOCH: u64 = 1_700_000_000;

/// One client plus handles on its collaborators.
pub struct TestPeer {
    pub client: Client,
    pub transport: Arc<MemoryRelayClient>,
    pub storage: Arc<MemoryStorage>,
    pub crypto: Arc<KeyChain>,
}

/// Configuration with fast retries and no automatic reconnect, so tests
/// control the connection themselves.
pub fn test_config(context: &str, controller: bool) -> ClientConfig {
    let mut config = ClientConfig {
        context: context.to_string(),
        controller,
        heartbeat_interval_ms: 50,
        request_timeout_ms: 2_000,
        ..ClientConfig::default()
    };
    config.relay.auto_reconnect = false;
    config.publisher.ack_timeout_ms = 500;
    config.publisher.max_attempts = 3;
    config.publisher.base_backoff_ms = 1;
    config.publisher.max_backoff_ms = 5;
    config
}

pub async fn spawn_peer(
    relay: &MemoryRelay,
    config: ClientConfig,
    clock: Arc<ManualClock>,
) -> anyhow::Result<TestPeer> {
    let transport = relay.client();
    let storage = Arc::new(MemoryStorage::new());
    let crypto = Arc::new(KeyChain::new());
    let client = Client::init(
        config,
        ClientDeps {
            crypto: crypto.clone(),
            storage: storage.clone(),
            transport: transport.clone(),
            clock,
        },
    )
    .await?;
    Ok(TestPeer {
        client,
        transport,
        storage,
        crypto,
    })
}

/// A non-controller dapp and a controller wallet on one relay.
pub async fn dapp_and_wallet(
    relay: &MemoryRelay,
    clock: Arc<ManualClock>,
) -> anyhow::Result<(TestPeer, TestPeer)> {
    let dapp = spawn_peer(relay, test_config("dapp", false), clock.clone()).await?;
    let wallet = spawn_peer(relay, test_config("wallet", true), clock).await?;
    Ok((dapp, wallet))
}

/// Wait for the first event matching `pred`.
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<SequenceEvent>,
    mut pred: F,
) -> anyhow::Result<SequenceEvent>
where
    F: FnMut(&SequenceEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("event stream closed"),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for event"))?
}

/// Pair two clients through a URI. Returns the settled pairing topic.
pub async fn pair(proposer: &Client, responder: &Client) -> anyhow::Result<String> {
    let mut proposer_events = proposer.pairing().subscribe();
    let mut responder_events = responder.pairing().subscribe();

    let pending = proposer.pairing().propose(ProposeParams::default()).await?;
    let Signal::Uri { uri } = &pending.proposal.signal else {
        bail!("pairing proposal without uri");
    };
    let received = responder.pair(uri).await?;
    responder
        .pairing()
        .respond(RespondParams::approve(received.proposal))
        .await?;

    let topic = settled_topic(&mut proposer_events).await?;
    let other = settled_topic(&mut responder_events).await?;
    if topic != other {
        bail!("pairing settled on different topics: {} vs {}", topic, other);
    }
    Ok(topic)
}

/// Propose a session over `pairing_topic` and approve it. Returns the
/// settled session topic.
pub async fn connect(
    proposer: &Client,
    responder: &Client,
    pairing_topic: &str,
    permissions: Capabilities,
) -> anyhow::Result<String> {
    let mut proposer_events = proposer.session().subscribe();
    let mut responder_events = responder.session().subscribe();

    proposer
        .connect(
            pairing_topic,
            ProposeParams {
                permissions,
                ..ProposeParams::default()
            },
        )
        .await?;

    let event = next_event(&mut responder_events, |e| {
        matches!(e, SequenceEvent::Proposed(_))
    })
    .await?;
    let SequenceEvent::Proposed(pending) = event else {
        bail!("unexpected event {:?}", event);
    };
    responder
        .session()
        .respond(RespondParams::approve(pending.proposal))
        .await?;

    let topic = settled_topic(&mut proposer_events).await?;
    settled_topic(&mut responder_events).await?;
    Ok(topic)
}

/// Pair and open a session in one go. Returns (pairing, session) topics.
pub async fn pair_and_connect(
    dapp: &Client,
    wallet: &Client,
    permissions: Capabilities,
) -> anyhow::Result<(String, String)> {
    let pairing = pair(dapp, wallet).await?;
    let session = connect(dapp, wallet, &pairing, permissions).await?;
    Ok((pairing, session))
}

async fn settled_topic(events: &mut broadcast::Receiver<SequenceEvent>) -> anyhow::Result<String> {
    match next_event(events, |e| matches!(e, SequenceEvent::Settled(_))).await? {
        SequenceEvent::Settled(settled) => Ok(settled.topic),
        other => bail!("unexpected event {:?}", other),
    }
}
