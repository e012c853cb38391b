//! Records, parameters and wire payloads of the sequence engine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_crypto::KeyHandle;

use crate::errors::Reason;
use crate::jsonrpc::{JsonRpcRequest, RequestArguments};
use crate::relayer::DEFAULT_RELAY_PROTOCOL;

// ============================================================================
// Participants and Metadata
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            params: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

// ============================================================================
// Permissions
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcPermissions {
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPermissions {
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainPermissions {
    #[serde(default)]
    pub chains: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPermissions {
    pub public_key: String,
}

/// The growable part of a permission set: what a proposal requests and what
/// an upgrade adds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub jsonrpc: JsonRpcPermissions,
    #[serde(default)]
    pub notifications: NotificationPermissions,
    #[serde(default)]
    pub blockchain: BlockchainPermissions,
}

impl Capabilities {
    pub fn methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jsonrpc: JsonRpcPermissions {
                methods: methods.into_iter().map(Into::into).collect(),
            },
            ..Self::default()
        }
    }

    pub fn with_chains<I, S>(mut self, chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blockchain.chains = chains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_notifications<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notifications.types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set union on every axis, keeping first-seen order.
    pub fn merge(&mut self, other: &Capabilities) {
        union_into(&mut self.jsonrpc.methods, &other.jsonrpc.methods);
        union_into(&mut self.notifications.types, &other.notifications.types);
        union_into(&mut self.blockchain.chains, &other.blockchain.chains);
    }

    /// Whether every entry of `other` is already granted.
    pub fn includes(&self, other: &Capabilities) -> bool {
        other.jsonrpc.methods.iter().all(|m| self.jsonrpc.methods.contains(m))
            && other
                .notifications
                .types
                .iter()
                .all(|t| self.notifications.types.contains(t))
            && other
                .blockchain
                .chains
                .iter()
                .all(|c| self.blockchain.chains.contains(c))
    }
}

fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Permissions of a settled sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub jsonrpc: JsonRpcPermissions,
    #[serde(default)]
    pub notifications: NotificationPermissions,
    #[serde(default)]
    pub blockchain: BlockchainPermissions,
    pub controller: ControllerPermissions,
}

impl Permissions {
    pub fn new(capabilities: Capabilities, controller_public_key: impl Into<String>) -> Self {
        Self {
            jsonrpc: capabilities.jsonrpc,
            notifications: capabilities.notifications,
            blockchain: capabilities.blockchain,
            controller: ControllerPermissions {
                public_key: controller_public_key.into(),
            },
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            jsonrpc: self.jsonrpc.clone(),
            notifications: self.notifications.clone(),
            blockchain: self.blockchain.clone(),
        }
    }

    /// Grow the permission set. The controller never changes.
    pub fn upgrade(&mut self, extra: &Capabilities) {
        let mut caps = self.capabilities();
        caps.merge(extra);
        self.jsonrpc = caps.jsonrpc;
        self.notifications = caps.notifications;
        self.blockchain = caps.blockchain;
    }

    pub fn includes(&self, other: &Capabilities) -> bool {
        self.capabilities().includes(other)
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.jsonrpc.methods.iter().any(|m| m == method)
    }

    pub fn allows_chain(&self, chain: &str) -> bool {
        self.blockchain.chains.iter().any(|c| c == chain)
    }

    pub fn allows_notification(&self, kind: &str) -> bool {
        self.notifications.types.iter().any(|t| t == kind)
    }
}

// ============================================================================
// State
// ============================================================================

/// Application state carried by a settled sequence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceState(pub IndexMap<String, Value>);

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Last write wins per field.
    pub fn merge(&mut self, partial: &SequenceState) {
        for (key, value) in &partial.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Proposals
// ============================================================================

/// How a proposal reaches the responder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum Signal {
    /// Out-of-band URI, for pairings
    Uri { uri: String },
    /// An already settled pairing, for sessions
    Pairing { topic: String },
}

impl Signal {
    pub fn method(&self) -> &'static str {
        match self {
            Signal::Uri { .. } => "uri",
            Signal::Pairing { .. } => "pairing",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub topic: String,
    /// Hex key encrypting traffic on the proposal topic
    pub sym_key: String,
    pub relay: RelayProtocolOptions,
    pub proposer: Participant,
    pub signal: Signal,
    pub permissions: Capabilities,
    /// Proposal lifetime in seconds
    pub ttl: u64,
}

/// Parameters of `propose`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProposeParams {
    pub relay: Option<RelayProtocolOptions>,
    /// Required for sessions: the settled pairing to signal over
    pub signal: Option<Signal>,
    pub permissions: Capabilities,
    pub metadata: Option<AppMetadata>,
    pub ttl: Option<u64>,
}

/// Parameters of `respond`.
#[derive(Clone, Debug, PartialEq)]
pub struct RespondParams {
    pub approved: bool,
    pub proposal: Proposal,
    /// Rejection reason; defaults to user rejected
    pub reason: Option<Reason>,
    pub state: SequenceState,
    pub metadata: Option<AppMetadata>,
}

impl RespondParams {
    pub fn approve(proposal: Proposal) -> Self {
        Self {
            approved: true,
            proposal,
            reason: None,
            state: SequenceState::default(),
            metadata: None,
        }
    }

    pub fn reject(proposal: Proposal, reason: Reason) -> Self {
        Self {
            approved: false,
            proposal,
            reason: Some(reason),
            state: SequenceState::default(),
            metadata: None,
        }
    }

    pub fn with_state(mut self, state: SequenceState) -> Self {
        self.state = state;
        self
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Proposed,
    Responded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Responded {
    /// Topic of the settled sequence
    pub topic: String,
    pub relay: RelayProtocolOptions,
    pub responder: Participant,
    pub expiry: u64,
    pub state: SequenceState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Responded(Responded),
    Rejected { reason: Reason },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSequence {
    pub status: PendingStatus,
    pub topic: String,
    pub relay: RelayProtocolOptions,
    pub self_participant: Participant,
    pub proposal: Proposal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledSequence {
    pub topic: String,
    pub relay: RelayProtocolOptions,
    pub shared_key: KeyHandle,
    pub self_participant: Participant,
    pub peer: Participant,
    pub permissions: Permissions,
    pub expiry: u64,
    pub state: SequenceState,
}

impl SettledSequence {
    pub fn is_controller(&self) -> bool {
        self.permissions.controller.public_key == self.self_participant.public_key
    }

    pub fn peer_is_controller(&self) -> bool {
        self.permissions.controller.public_key == self.peer.public_key
    }
}

// ============================================================================
// Wire Payloads
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveParams {
    /// Settled topic the responder derived
    pub topic: String,
    pub relay: RelayProtocolOptions,
    pub responder: Participant,
    pub expiry: u64,
    #[serde(default)]
    pub state: SequenceState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonParams {
    pub reason: Reason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeParams {
    pub permissions: Capabilities,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub state: SequenceState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendParams {
    pub expiry: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadParams {
    pub request: RequestArguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum SequenceEvent {
    Proposed(PendingSequence),
    Responded(PendingSequence),
    Settled(SettledSequence),
    Updated(SettledSequence),
    Upgraded(SettledSequence),
    Extended(SettledSequence),
    Deleted { topic: String, reason: Reason },
    /// Application request from the peer; answer with `reply`
    Request {
        topic: String,
        request: JsonRpcRequest,
        chain_id: Option<String>,
    },
    Notification {
        topic: String,
        notification: Notification,
    },
    Error { topic: String, error: String },
}
