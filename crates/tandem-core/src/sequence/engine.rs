//! Generic sequence state machine shared by pairing and session.
//!
//! ```text
//! (none) --propose--> Proposed --respond(approve)--> Responded --settle--> Settled
//! Proposed --respond(reject)--> (none)
//! Responded --settle fails--> (none)
//! Settled --upgrade/update/extend--> Settled
//! Settled --delete/expire--> (none)
//! ```
//!
//! Every mutating operation and every inbound handler for a topic runs under
//! that topic's lock. Awaiting a peer response happens outside the lock so
//! the inbound side can make progress.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tandem_crypto::Crypto;
use tandem_transport::PublishOptions;

use crate::errors::{codes, ExpirerError, Reason, SequenceError};
use crate::expirer::{Expirer, ExpiryTarget};
use crate::history::{HistoryEvent, JsonRpcHistory, JsonRpcRecord};
use crate::jsonrpc::{payload_id, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, RequestArguments};
use crate::locks::TopicLocks;
use crate::messages::MessageTracker;
use crate::relayer::Relayer;
use crate::sequence::policy::{SequenceKind, SequenceMethod};
use crate::sequence::types::*;
use crate::storage::{KeyValueStorage, StorageKey};
use crate::store::Store;
use crate::uri::{PairingUri, URI_VERSION};

const EVENT_CAPACITY: usize = 256;

/// Default bound for awaiting a peer response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Configuration and Dependencies
// ============================================================================

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Whether this client acts as the controller
    pub controller: bool,
    pub metadata: Option<AppMetadata>,
    pub relay: RelayProtocolOptions,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller: false,
            metadata: None,
            relay: RelayProtocolOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Collaborators shared by both engines of a client.
#[derive(Clone)]
pub struct EngineDeps {
    pub crypto: Arc<dyn Crypto>,
    pub relayer: Arc<Relayer>,
    pub history: Arc<JsonRpcHistory>,
    pub expirer: Arc<Expirer>,
    pub messages: Arc<MessageTracker>,
    pub storage: Arc<dyn KeyValueStorage>,
    pub storage_key: StorageKey,
}

// ============================================================================
// Engine
// ============================================================================

pub struct SequenceEngine {
    kind: SequenceKind,
    config: EngineConfig,
    crypto: Arc<dyn Crypto>,
    relayer: Arc<Relayer>,
    history: Arc<JsonRpcHistory>,
    expirer: Arc<Expirer>,
    messages: Arc<MessageTracker>,
    pending: Store<PendingSequence>,
    settled: Store<SettledSequence>,
    locks: TopicLocks,
    /// Pairing engine sessions signal over
    parent: Option<Arc<SequenceEngine>>,
    events: broadcast::Sender<SequenceEvent>,
}

impl SequenceEngine {
    pub fn new(
        kind: SequenceKind,
        config: EngineConfig,
        deps: &EngineDeps,
        parent: Option<Arc<SequenceEngine>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind,
            config,
            crypto: deps.crypto.clone(),
            relayer: deps.relayer.clone(),
            history: deps.history.clone(),
            expirer: deps.expirer.clone(),
            messages: deps.messages.clone(),
            pending: Store::new(deps.storage.clone(), &deps.storage_key, &kind.pending_context()),
            settled: Store::new(deps.storage.clone(), &deps.storage_key, &kind.settled_context()),
            locks: TopicLocks::new(),
            parent,
            events,
        }
    }

    /// Restore pending and settled records.
    pub async fn init(&self) -> Result<(), SequenceError> {
        self.pending.init().await?;
        self.settled.init().await?;
        debug!(
            kind = %self.kind,
            pending = self.pending.len(),
            settled = self.settled.len(),
            "sequence engine ready"
        );
        Ok(())
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// Whether the topic has a pending or settled record here.
    pub fn owns(&self, topic: &str) -> bool {
        self.pending.contains(topic) || self.settled.contains(topic)
    }

    pub fn get(&self, topic: &str) -> Result<SettledSequence, SequenceError> {
        self.settled
            .get(topic)
            .map_err(|_| SequenceError::not_found(self.kind.name(), topic))
    }

    pub fn get_pending(&self, topic: &str) -> Result<PendingSequence, SequenceError> {
        self.pending
            .get(topic)
            .map_err(|_| SequenceError::not_found(format!("pending {}", self.kind), topic))
    }

    pub fn settled(&self) -> Vec<SettledSequence> {
        self.settled.values()
    }

    pub fn pending(&self) -> Vec<PendingSequence> {
        self.pending.values()
    }

    /// Settled records whose permissions include everything in `filter`.
    pub fn find(&self, filter: &Capabilities) -> Vec<SettledSequence> {
        self.settled
            .values()
            .into_iter()
            .filter(|s| s.permissions.includes(filter))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Proposal
    // ------------------------------------------------------------------------

    /// Start a new sequence as the proposer.
    pub async fn propose(&self, params: ProposeParams) -> Result<PendingSequence, SequenceError> {
        let relay = params.relay.unwrap_or_else(|| self.config.relay.clone());
        if relay.protocol.is_empty() {
            return Err(SequenceError::InvalidParams("relay protocol is required".into()));
        }
        let ttl = params.ttl.unwrap_or_else(|| self.kind.default_proposal_ttl());
        if ttl == 0 {
            return Err(SequenceError::InvalidParams("ttl must be positive".into()));
        }
        let pairing_topic = self.signal_topic(params.signal.as_ref())?;

        let mut permissions = self.kind.default_capabilities();
        permissions.merge(&params.permissions);

        let (handle, sym_key) = self.crypto.generate_sym_key()?;
        let topic = handle.topic().to_string();
        let _guard = self.locks.lock(&topic).await;

        let proposer = Participant {
            public_key: self.crypto.generate_key_pair()?,
            controller: self.config.controller,
            metadata: params.metadata.or_else(|| self.config.metadata.clone()),
        };
        let signal = match &pairing_topic {
            Some(pairing) => Signal::Pairing {
                topic: pairing.clone(),
            },
            None => Signal::Uri {
                uri: PairingUri {
                    topic: topic.clone(),
                    version: URI_VERSION,
                    public_key: proposer.public_key.clone(),
                    sym_key: sym_key.clone(),
                    controller: proposer.controller,
                    relay: relay.clone(),
                    ttl,
                }
                .to_string(),
            },
        };
        let proposal = Proposal {
            topic: topic.clone(),
            sym_key,
            relay: relay.clone(),
            proposer: proposer.clone(),
            signal,
            permissions,
            ttl,
        };
        let record = PendingSequence {
            status: PendingStatus::Proposed,
            topic: topic.clone(),
            relay,
            self_participant: proposer,
            proposal,
            outcome: None,
        };

        self.pending.set(&topic, record.clone()).await?;
        if let Err(e) = self.announce(&record, pairing_topic.as_deref()).await {
            warn!(kind = %self.kind, topic = %topic, error = %e, "proposal withdrawn");
            let reason = Reason::new(codes::INTERNAL, format!("Proposal not delivered: {}", e));
            if let Err(cleanup) = self.remove_pending(&record, reason).await {
                warn!(topic = %topic, error = %cleanup, "failed to withdraw proposal");
            }
            drop(_guard);
            self.locks.prune(&topic);
            return Err(e);
        }

        info!(kind = %self.kind, topic = %topic, "proposed");
        let _ = self.events.send(SequenceEvent::Proposed(record.clone()));
        Ok(record)
    }

    /// Record a proposal received from a peer, as the responder.
    pub async fn ingest_proposal(&self, proposal: Proposal) -> Result<PendingSequence, SequenceError> {
        if proposal.topic.is_empty() || proposal.sym_key.is_empty() {
            return Err(SequenceError::MissingOrInvalid("proposal topic and key are required".into()));
        }
        if proposal.proposer.public_key.is_empty() {
            return Err(SequenceError::MissingOrInvalid("proposer public key is required".into()));
        }
        self.kind.validate_signal(&proposal.signal)?;
        self.signal_topic(Some(&proposal.signal))?;

        let topic = proposal.topic.clone();
        let _guard = self.locks.lock(&topic).await;
        if self.owns(&topic) {
            return Err(SequenceError::InvalidState(format!("{} {} already known", self.kind, topic)));
        }

        let handle = self
            .crypto
            .set_sym_key(&proposal.sym_key)
            .map_err(|e| SequenceError::MissingOrInvalid(e.to_string()))?;
        if handle.topic() != topic {
            self.crypto.delete_key(handle.topic())?;
            return Err(SequenceError::MissingOrInvalid(
                "proposal topic does not match its key".into(),
            ));
        }

        let record = PendingSequence {
            status: PendingStatus::Proposed,
            topic: topic.clone(),
            relay: proposal.relay.clone(),
            self_participant: Participant {
                public_key: self.crypto.generate_key_pair()?,
                controller: self.config.controller,
                metadata: self.config.metadata.clone(),
            },
            proposal: proposal.clone(),
            outcome: None,
        };
        self.pending.set(&topic, record.clone()).await?;
        self.expirer
            .set(ExpiryTarget::Topic(topic.clone()), self.expirer.now() + proposal.ttl)
            .await?;

        info!(kind = %self.kind, topic = %topic, "proposal received");
        let _ = self.events.send(SequenceEvent::Proposed(record.clone()));
        Ok(record)
    }

    /// Approve or reject a received proposal.
    pub async fn respond(&self, params: RespondParams) -> Result<PendingSequence, SequenceError> {
        let proposal = params.proposal;
        if proposal.topic.is_empty() || proposal.proposer.public_key.is_empty() {
            return Err(SequenceError::MissingOrInvalid("proposal is incomplete".into()));
        }
        self.kind.validate_signal(&proposal.signal)?;

        let topic = proposal.topic.clone();
        let _guard = self.locks.lock(&topic).await;
        let pending = self.get_pending(&topic)?;
        if pending.status != PendingStatus::Proposed {
            return Err(SequenceError::InvalidState(format!("{} {} already responded", self.kind, topic)));
        }
        if pending.proposal != proposal {
            return Err(SequenceError::MissingOrInvalid(
                "proposal does not match the pending record".into(),
            ));
        }

        if !params.approved {
            let reason = params.reason.unwrap_or_else(Reason::user_rejected);
            self.send_untracked(&topic, SequenceMethod::Reject, &ReasonParams { reason: reason.clone() })
                .await?;
            self.remove_pending(&pending, reason.clone()).await?;

            let record = PendingSequence {
                status: PendingStatus::Responded,
                outcome: Some(Outcome::Rejected { reason }),
                ..pending
            };
            info!(kind = %self.kind, topic = %topic, "rejected");
            let _ = self.events.send(SequenceEvent::Responded(record.clone()));
            drop(_guard);
            self.locks.prune(&topic);
            return Ok(record);
        }

        let responder = Participant {
            public_key: pending.self_participant.public_key.clone(),
            controller: self.config.controller,
            metadata: params.metadata.or_else(|| self.config.metadata.clone()),
        };
        ensure_one_controller(&proposal.proposer, &responder)?;

        let shared = self
            .crypto
            .generate_shared_key(&responder.public_key, &proposal.proposer.public_key)?;
        let responded = Responded {
            topic: shared.topic().to_string(),
            relay: proposal.relay.clone(),
            responder: responder.clone(),
            expiry: self.expirer.now() + self.kind.default_settled_ttl(),
            state: params.state,
        };
        let record = PendingSequence {
            status: PendingStatus::Responded,
            self_participant: responder,
            outcome: Some(Outcome::Responded(responded.clone())),
            ..pending
        };

        self.pending.set(&topic, record.clone()).await?;
        self.relayer.subscribe(&topic).await?;
        self.send_request(
            &topic,
            SequenceMethod::Approve,
            &ApproveParams {
                topic: responded.topic.clone(),
                relay: responded.relay,
                responder: responded.responder,
                expiry: responded.expiry,
                state: responded.state,
            },
        )
        .await?;

        info!(kind = %self.kind, topic = %topic, settled_topic = %responded.topic, "approved");
        let _ = self.events.send(SequenceEvent::Responded(record.clone()));
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Settled operations
    // ------------------------------------------------------------------------

    /// Grow the permission set. Controller only.
    pub async fn upgrade(
        &self,
        topic: &str,
        permissions: Capabilities,
    ) -> Result<SettledSequence, SequenceError> {
        let _guard = self.locks.lock(topic).await;
        let mut settled = self.get(topic)?;
        if !settled.is_controller() {
            return Err(SequenceError::Unauthorized("only the controller may upgrade".into()));
        }

        settled.permissions.upgrade(&permissions);
        self.settled.set(topic, settled.clone()).await?;
        self.send_request(topic, SequenceMethod::Upgrade, &UpgradeParams { permissions })
            .await?;

        info!(kind = %self.kind, topic = %topic, "upgraded");
        let _ = self.events.send(SequenceEvent::Upgraded(settled.clone()));
        Ok(settled)
    }

    /// Merge state, last write wins per field. Controller only.
    pub async fn update(
        &self,
        topic: &str,
        state: SequenceState,
    ) -> Result<SettledSequence, SequenceError> {
        let _guard = self.locks.lock(topic).await;
        let mut settled = self.get(topic)?;
        if !settled.is_controller() {
            return Err(SequenceError::Unauthorized("only the controller may update".into()));
        }

        settled.state.merge(&state);
        self.settled.set(topic, settled.clone()).await?;
        self.send_request(topic, SequenceMethod::Update, &UpdateParams { state })
            .await?;

        info!(kind = %self.kind, topic = %topic, "updated");
        let _ = self.events.send(SequenceEvent::Updated(settled.clone()));
        Ok(settled)
    }

    /// Push the expiry out. Controller only; must strictly increase.
    pub async fn extend(&self, topic: &str, expiry: u64) -> Result<SettledSequence, SequenceError> {
        let _guard = self.locks.lock(topic).await;
        let mut settled = self.get(topic)?;
        if !settled.is_controller() {
            return Err(SequenceError::Unauthorized("only the controller may extend".into()));
        }
        if expiry <= settled.expiry {
            return Err(SequenceError::InvalidExtendRequest {
                current: settled.expiry,
                requested: expiry,
            });
        }

        self.apply_extend(&mut settled, expiry).await?;
        self.send_request(topic, SequenceMethod::Extend, &ExtendParams { expiry })
            .await?;

        info!(kind = %self.kind, topic = %topic, expiry, "extended");
        let _ = self.events.send(SequenceEvent::Extended(settled.clone()));
        Ok(settled)
    }

    /// Liveness check. Fails with `Timeout` if the peer does not answer in time.
    pub async fn ping(&self, topic: &str, timeout: Option<Duration>) -> Result<(), SequenceError> {
        let responses = self.history.subscribe();
        let id = {
            let _guard = self.locks.lock(topic).await;
            self.get(topic)?;
            self.send_request(topic, SequenceMethod::Ping, &json!({})).await?
        };

        let timeout = timeout.unwrap_or(self.config.request_timeout);
        match self.await_response(responses, topic, id, timeout).await? {
            JsonRpcResponse::Result(_) => Ok(()),
            JsonRpcResponse::Error(e) => Err(e.error.into()),
        }
    }

    /// Send an application request and wait for the peer's answer.
    pub async fn request(
        &self,
        topic: &str,
        request: RequestArguments,
        chain_id: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Value, SequenceError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let responses = self.history.subscribe();
        let id = {
            let _guard = self.locks.lock(topic).await;
            let settled = self.get(topic)?;
            authorize_request(&settled.permissions, &request.method, chain_id.as_deref())?;
            self.send_payload(topic, request, chain_id, timeout).await?
        };

        match self.await_response(responses, topic, id, timeout).await? {
            JsonRpcResponse::Result(r) => Ok(r.result),
            JsonRpcResponse::Error(e) => Err(e.error.into()),
        }
    }

    /// Answer a request received through a `Request` event.
    pub async fn reply(&self, topic: &str, response: JsonRpcResponse) -> Result<(), SequenceError> {
        self.get(topic)?;
        self.send_response(topic, response).await
    }

    /// Send a notification the settled permissions allow.
    pub async fn notify(&self, topic: &str, notification: Notification) -> Result<(), SequenceError> {
        let _guard = self.locks.lock(topic).await;
        let settled = self.get(topic)?;
        if !settled.permissions.allows_notification(&notification.kind) {
            return Err(SequenceError::UnauthorizedTarget(format!(
                "notification type {}",
                notification.kind
            )));
        }
        self.send_untracked(topic, SequenceMethod::Notification, &notification)
            .await?;
        Ok(())
    }

    /// Tear down a settled sequence and tell the peer.
    pub async fn delete(&self, topic: &str, reason: Reason) -> Result<(), SequenceError> {
        {
            let _guard = self.locks.lock(topic).await;
            self.get(topic)?;

            let notice = ReasonParams {
                reason: reason.clone(),
            };
            if let Err(e) = self.send_untracked(topic, SequenceMethod::Delete, &notice).await {
                warn!(kind = %self.kind, topic = %topic, error = %e, "delete notice not sent");
            }
            self.teardown_settled(topic, reason).await?;
        }
        self.locks.prune(topic);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Handle a request the peer sent on one of our topics.
    pub async fn on_request(&self, topic: &str, request: JsonRpcRequest) {
        let Some(method) = self.kind.parse_method(&request.method) else {
            let err = SequenceError::MissingOrInvalid(format!("unsupported method {}", request.method));
            self.fail_request(topic, request.id, true, err).await;
            return;
        };
        debug!(kind = %self.kind, topic = %topic, method = %request.method, id = request.id, "inbound request");

        let result = {
            let _guard = self.locks.lock(topic).await;
            match method {
                SequenceMethod::Approve => self.handle_approve(topic, &request).await,
                SequenceMethod::Reject => self.handle_reject(topic, &request).await,
                SequenceMethod::Upgrade => self.handle_upgrade(topic, &request).await,
                SequenceMethod::Update => self.handle_update(topic, &request).await,
                SequenceMethod::Extend => self.handle_extend(topic, &request).await,
                SequenceMethod::Delete => self.handle_delete(topic, &request).await,
                SequenceMethod::Ping => self.get(topic).map(|_| Some(json!(true))),
                SequenceMethod::Payload => self.handle_payload(topic, &request),
                SequenceMethod::Notification => self.handle_notification(topic, &request),
            }
        };
        self.release_lock(topic);

        match result {
            Ok(Some(value)) => {
                let response = JsonRpcResponse::result(request.id, value);
                if let Err(e) = self.send_response(topic, response).await {
                    warn!(kind = %self.kind, topic = %topic, error = %e, "failed to acknowledge request");
                }
            }
            Ok(None) => {}
            Err(e) => self.fail_request(topic, request.id, expects_reply(method), e).await,
        }
    }

    /// Handle a response to one of our tracked requests, after the history
    /// resolved it.
    pub async fn on_response(&self, topic: &str, record: JsonRpcRecord) {
        self.forget_expiry(&ExpiryTarget::Id(record.id)).await;

        let Some(response) = record.response else {
            return;
        };
        let Some(method) = self.kind.parse_method(&record.request.method) else {
            // Application payloads are picked up by whoever awaits them.
            return;
        };

        if method == SequenceMethod::Approve {
            let result = {
                let _guard = self.locks.lock(topic).await;
                self.handle_approve_response(topic, &response).await
            };
            self.release_lock(topic);
            if let Err(e) = result {
                warn!(kind = %self.kind, topic = %topic, error = %e, "settlement failed");
                let _ = self.events.send(SequenceEvent::Error {
                    topic: topic.to_string(),
                    error: e.to_string(),
                });
            }
            return;
        }

        if let Some(error) = response.error_object() {
            warn!(
                kind = %self.kind,
                topic = %topic,
                method = %record.request.method,
                code = error.code,
                message = %error.message,
                "peer rejected request"
            );
        }
    }

    /// React to an expired topic.
    pub async fn on_expired(&self, topic: &str) -> Result<(), SequenceError> {
        {
            let _guard = self.locks.lock(topic).await;
            if let Ok(pending) = self.pending.get(topic) {
                self.remove_pending(&pending, Reason::expired()).await?;
                info!(kind = %self.kind, topic = %topic, "proposal expired");
                let _ = self.events.send(SequenceEvent::Deleted {
                    topic: topic.to_string(),
                    reason: Reason::expired(),
                });
            } else if self.settled.contains(topic) {
                self.teardown_settled(topic, Reason::expired()).await?;
            }
        }
        self.release_lock(topic);
        Ok(())
    }

    async fn handle_approve(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let pending = self.get_pending(topic)?;
        if pending.status != PendingStatus::Proposed {
            return Err(SequenceError::InvalidState("proposal already answered".into()));
        }
        let params: ApproveParams = parse_params(request)?;
        ensure_one_controller(&pending.proposal.proposer, &params.responder)?;

        let shared = self
            .crypto
            .generate_shared_key(&pending.self_participant.public_key, &params.responder.public_key)?;
        if shared.topic() != params.topic {
            self.crypto.delete_key(shared.topic())?;
            return Err(SequenceError::InvalidParams("settled topic does not match shared key".into()));
        }

        let controller = if pending.proposal.proposer.controller {
            &pending.self_participant.public_key
        } else {
            &params.responder.public_key
        };
        let settled = SettledSequence {
            topic: params.topic.clone(),
            relay: params.relay,
            shared_key: shared,
            self_participant: pending.self_participant.clone(),
            peer: params.responder.clone(),
            permissions: Permissions::new(pending.proposal.permissions.clone(), controller.clone()),
            expiry: params.expiry,
            state: params.state,
        };

        self.settle(&pending, settled.clone()).await?;
        self.send_response(topic, JsonRpcResponse::result(request.id, json!(true)))
            .await?;
        self.drop_proposal_topic(topic).await;
        self.forget_key_pair(&pending.self_participant.public_key);

        let _ = self.events.send(SequenceEvent::Settled(settled));
        Ok(None)
    }

    async fn handle_approve_response(
        &self,
        topic: &str,
        response: &JsonRpcResponse,
    ) -> Result<(), SequenceError> {
        // The proposal may have expired while we waited.
        let Ok(pending) = self.pending.get(topic) else {
            debug!(kind = %self.kind, topic = %topic, "approval acknowledged for unknown proposal");
            return Ok(());
        };
        let Some(Outcome::Responded(responded)) = pending.outcome.clone() else {
            return Err(SequenceError::InvalidState("proposal was not approved".into()));
        };

        if let Some(error) = response.error_object() {
            warn!(kind = %self.kind, topic = %topic, code = error.code, "proposer refused settlement");
            let reason = Reason::settle_failed(&error.message);
            self.abandon_settlement(&pending, &responded.topic, reason).await;
            return Ok(());
        }

        let settled_topic = responded.topic.clone();
        let result = self.settle_responded(&pending, responded).await;
        if let Err(e) = &result {
            self.abandon_settlement(&pending, &settled_topic, Reason::settle_failed(e)).await;
        }
        result
    }

    async fn settle_responded(
        &self,
        pending: &PendingSequence,
        responded: Responded,
    ) -> Result<(), SequenceError> {
        let proposer = pending.proposal.proposer.clone();
        let shared = self
            .crypto
            .generate_shared_key(&responded.responder.public_key, &proposer.public_key)?;
        let controller = if responded.responder.controller {
            responded.responder.public_key.clone()
        } else {
            proposer.public_key.clone()
        };
        let settled = SettledSequence {
            topic: responded.topic,
            relay: responded.relay,
            shared_key: shared,
            self_participant: responded.responder,
            peer: proposer,
            permissions: Permissions::new(pending.proposal.permissions.clone(), controller),
            expiry: responded.expiry,
            state: responded.state,
        };

        self.settle(pending, settled.clone()).await?;
        self.drop_proposal_topic(&pending.topic).await;
        self.forget_key_pair(&settled.self_participant.public_key);
        let _ = self.events.send(SequenceEvent::Settled(settled));
        Ok(())
    }

    async fn handle_reject(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let pending = self.get_pending(topic)?;
        let ReasonParams { reason } = parse_params(request)?;
        self.remove_pending(&pending, reason.clone()).await?;

        info!(kind = %self.kind, topic = %topic, code = reason.code, "proposal rejected by peer");
        let _ = self.events.send(SequenceEvent::Deleted {
            topic: topic.to_string(),
            reason,
        });
        Ok(None)
    }

    async fn handle_upgrade(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let mut settled = self.controller_request(topic, "upgrade")?;
        let UpgradeParams { permissions } = parse_params(request)?;

        settled.permissions.upgrade(&permissions);
        self.settled.set(topic, settled.clone()).await?;
        let _ = self.events.send(SequenceEvent::Upgraded(settled));
        Ok(Some(json!(true)))
    }

    async fn handle_update(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let mut settled = self.controller_request(topic, "update")?;
        let UpdateParams { state } = parse_params(request)?;

        settled.state.merge(&state);
        self.settled.set(topic, settled.clone()).await?;
        let _ = self.events.send(SequenceEvent::Updated(settled));
        Ok(Some(json!(true)))
    }

    async fn handle_extend(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let mut settled = self.controller_request(topic, "extend")?;
        let ExtendParams { expiry } = parse_params(request)?;
        if expiry <= settled.expiry {
            return Err(SequenceError::InvalidExtendRequest {
                current: settled.expiry,
                requested: expiry,
            });
        }

        self.apply_extend(&mut settled, expiry).await?;
        let _ = self.events.send(SequenceEvent::Extended(settled));
        Ok(Some(json!(true)))
    }

    async fn handle_delete(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        self.get(topic)?;
        let ReasonParams { reason } = parse_params(request)?;
        self.teardown_settled(topic, reason).await?;
        Ok(None)
    }

    fn handle_payload(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let settled = self.get(topic)?;
        let PayloadParams { request: inner, chain_id } = parse_params(request)?;
        authorize_request(&settled.permissions, &inner.method, chain_id.as_deref())?;

        let _ = self.events.send(SequenceEvent::Request {
            topic: topic.to_string(),
            request: JsonRpcRequest::with_id(request.id, inner.method, inner.params),
            chain_id,
        });
        Ok(None)
    }

    fn handle_notification(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, SequenceError> {
        let settled = self.get(topic)?;
        let notification: Notification = parse_params(request)?;
        if !settled.permissions.allows_notification(&notification.kind) {
            return Err(SequenceError::UnauthorizedTarget(format!(
                "notification type {}",
                notification.kind
            )));
        }
        let _ = self.events.send(SequenceEvent::Notification {
            topic: topic.to_string(),
            notification,
        });
        Ok(None)
    }

    // ------------------------------------------------------------------------
    // Lifecycle helpers
    // ------------------------------------------------------------------------

    async fn settle(
        &self,
        pending: &PendingSequence,
        settled: SettledSequence,
    ) -> Result<(), SequenceError> {
        self.settled.set(&settled.topic, settled.clone()).await?;
        self.pending.delete(&pending.topic, Reason::settled()).await?;
        self.forget_expiry(&ExpiryTarget::Topic(pending.topic.clone())).await;
        self.expirer
            .set(ExpiryTarget::Topic(settled.topic.clone()), settled.expiry)
            .await?;
        self.relayer.subscribe(&settled.topic).await?;

        info!(
            kind = %self.kind,
            topic = %settled.topic,
            proposal = %pending.topic,
            controller = settled.is_controller(),
            "settled"
        );
        Ok(())
    }

    /// The proposal topic is dead once the sequence settled.
    async fn drop_proposal_topic(&self, topic: &str) {
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "failed to unsubscribe proposal topic");
        }
        if let Err(e) = self.history.delete(topic).await {
            warn!(topic = %topic, error = %e, "failed to purge proposal history");
        }
        if let Err(e) = self.crypto.delete_key(topic) {
            warn!(topic = %topic, error = %e, "failed to delete proposal key");
        }
        self.messages.delete(topic);
    }

    /// Subscribe to a fresh proposal topic, start its expiry and, for
    /// sessions, signal it over the pairing.
    async fn announce(
        &self,
        record: &PendingSequence,
        pairing_topic: Option<&str>,
    ) -> Result<(), SequenceError> {
        let topic = &record.topic;
        self.relayer.subscribe(topic).await?;
        self.expirer
            .set(ExpiryTarget::Topic(topic.clone()), self.expirer.now() + record.proposal.ttl)
            .await?;

        if let (Some(pairing), Some(parent)) = (pairing_topic, &self.parent) {
            let args = RequestArguments {
                method: crate::sequence::policy::SESSION_PROPOSE_METHOD.to_string(),
                params: serde_json::to_value(&record.proposal)?,
            };
            parent
                .send_payload(pairing, args, None, self.config.request_timeout)
                .await?;
        }
        Ok(())
    }

    async fn remove_pending(
        &self,
        pending: &PendingSequence,
        reason: Reason,
    ) -> Result<(), SequenceError> {
        let topic = &pending.topic;
        self.pending.delete(topic, reason).await?;
        self.forget_expiry(&ExpiryTarget::Topic(topic.clone())).await;
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "failed to unsubscribe proposal topic");
        }
        self.history.delete(topic).await?;
        self.crypto.delete_key(topic)?;
        self.crypto
            .delete_key_pair(&pending.self_participant.public_key)?;
        self.messages.delete(topic);
        Ok(())
    }

    async fn teardown_settled(&self, topic: &str, reason: Reason) -> Result<(), SequenceError> {
        self.settled.delete(topic, reason.clone()).await?;
        self.history.delete(topic).await?;
        self.forget_expiry(&ExpiryTarget::Topic(topic.to_string())).await;
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "failed to unsubscribe");
        }
        self.crypto.delete_key(topic)?;
        self.messages.delete(topic);

        info!(kind = %self.kind, topic = %topic, code = reason.code, "deleted");
        let _ = self.events.send(SequenceEvent::Deleted {
            topic: topic.to_string(),
            reason,
        });
        Ok(())
    }

    async fn apply_extend(
        &self,
        settled: &mut SettledSequence,
        expiry: u64,
    ) -> Result<(), SequenceError> {
        self.expirer
            .set(ExpiryTarget::Topic(settled.topic.clone()), expiry)
            .await?;
        settled.expiry = expiry;
        self.settled.set(&settled.topic, settled.clone()).await?;
        Ok(())
    }

    /// Roll a responded proposal back to nothing after settlement failed.
    /// Cleanup is best effort so one failing step does not strand the rest.
    async fn abandon_settlement(
        &self,
        pending: &PendingSequence,
        settled_topic: &str,
        reason: Reason,
    ) {
        if self.settled.contains(settled_topic) {
            if let Err(e) = self.settled.delete(settled_topic, reason.clone()).await {
                warn!(topic = %settled_topic, error = %e, "failed to drop half-settled record");
            }
        }
        self.forget_expiry(&ExpiryTarget::Topic(settled_topic.to_string())).await;
        if let Err(e) = self.relayer.unsubscribe(settled_topic).await {
            warn!(topic = %settled_topic, error = %e, "failed to unsubscribe");
        }
        if let Err(e) = self.crypto.delete_key(settled_topic) {
            warn!(topic = %settled_topic, error = %e, "failed to delete settled key");
        }
        if let Err(e) = self.remove_pending(pending, reason.clone()).await {
            warn!(topic = %pending.topic, error = %e, "failed to drop proposal");
        }

        info!(kind = %self.kind, topic = %pending.topic, code = reason.code, "settlement abandoned");
        let _ = self.events.send(SequenceEvent::Deleted {
            topic: pending.topic.clone(),
            reason,
        });
    }

    /// Our key pair is only needed until the shared key exists.
    fn forget_key_pair(&self, public_key: &str) {
        if let Err(e) = self.crypto.delete_key_pair(public_key) {
            warn!(error = %e, "failed to delete key pair");
        }
    }

    /// Drop the topic's lock once nothing here owns the topic.
    fn release_lock(&self, topic: &str) {
        if !self.owns(topic) {
            self.locks.prune(topic);
        }
    }

    async fn forget_expiry(&self, target: &ExpiryTarget) {
        match self.expirer.del(target).await {
            Ok(()) | Err(ExpirerError::NotFound(_)) => {}
            Err(e) => warn!(expiry_target = %target, error = %e, "failed to drop expiry"),
        }
    }

    /// Settled record for a peer-initiated mutation, which only the
    /// controller may send.
    fn controller_request(&self, topic: &str, what: &str) -> Result<SettledSequence, SequenceError> {
        let settled = self.get(topic)?;
        if !settled.peer_is_controller() {
            return Err(SequenceError::Unauthorized(format!(
                "only the controller may {}",
                what
            )));
        }
        Ok(settled)
    }

    /// Resolve the pairing topic a signal refers to, checking it is settled.
    fn signal_topic(&self, signal: Option<&Signal>) -> Result<Option<String>, SequenceError> {
        match self.kind {
            SequenceKind::Pairing => match signal {
                None | Some(Signal::Uri { .. }) => Ok(None),
                Some(other) => Err(SequenceError::UnsupportedSignal {
                    expected: self.kind.expected_signal().into(),
                    actual: other.method().into(),
                }),
            },
            SequenceKind::Session => {
                let topic = match signal {
                    Some(Signal::Pairing { topic }) => topic,
                    Some(other) => {
                        return Err(SequenceError::UnsupportedSignal {
                            expected: self.kind.expected_signal().into(),
                            actual: other.method().into(),
                        })
                    }
                    None => {
                        return Err(SequenceError::InvalidParams(
                            "session proposals need a pairing signal".into(),
                        ))
                    }
                };
                let parent = self.parent.as_ref().ok_or_else(|| {
                    SequenceError::InvalidState("session engine has no pairing engine".into())
                })?;
                parent.get(topic)?;
                Ok(Some(topic.clone()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Wire
    // ------------------------------------------------------------------------

    /// Publish an application payload and track it. Returns the request id.
    ///
    /// The id expiry only marks the request as overdue. Its history record
    /// stays until a response arrives or the topic goes away.
    pub(crate) async fn send_payload(
        &self,
        topic: &str,
        request: RequestArguments,
        chain_id: Option<String>,
        timeout: Duration,
    ) -> Result<u64, SequenceError> {
        let id = payload_id();
        let params = PayloadParams {
            request: request.clone(),
            chain_id: chain_id.clone(),
        };
        let wire = JsonRpcRequest::with_id(
            id,
            self.kind.method(SequenceMethod::Payload),
            serde_json::to_value(&params)?,
        );

        self.history.set(topic, id, request, chain_id).await?;
        self.expirer
            .set(ExpiryTarget::Id(id), self.expirer.now() + timeout.as_secs().max(1))
            .await?;

        let opts = PublishOptions {
            prompt: true,
            ..PublishOptions::default()
        };
        if let Err(e) = self.publish(topic, &wire.into(), opts).await {
            // Never reached the relay, so no answer can come.
            if let Err(cleanup) = self.history.delete_record(id).await {
                warn!(topic = %topic, id, error = %cleanup, "failed to drop unsent request");
            }
            self.forget_expiry(&ExpiryTarget::Id(id)).await;
            return Err(e);
        }
        debug!(kind = %self.kind, topic = %topic, id, "payload sent");
        Ok(id)
    }

    async fn send_request<P: Serialize>(
        &self,
        topic: &str,
        method: SequenceMethod,
        params: &P,
    ) -> Result<u64, SequenceError> {
        let request = JsonRpcRequest::new(self.kind.method(method), serde_json::to_value(params)?);
        let id = request.id;
        self.history
            .set(topic, id, request.arguments(), None)
            .await?;
        self.publish(topic, &request.into(), PublishOptions::default())
            .await?;
        debug!(kind = %self.kind, topic = %topic, ?method, id, "request sent");
        Ok(id)
    }

    /// Publish a request the peer does not answer.
    async fn send_untracked<P: Serialize>(
        &self,
        topic: &str,
        method: SequenceMethod,
        params: &P,
    ) -> Result<u64, SequenceError> {
        let request = JsonRpcRequest::new(self.kind.method(method), serde_json::to_value(params)?);
        let id = request.id;
        self.publish(topic, &request.into(), PublishOptions::default())
            .await?;
        debug!(kind = %self.kind, topic = %topic, ?method, id, "notice sent");
        Ok(id)
    }

    async fn send_response(
        &self,
        topic: &str,
        response: JsonRpcResponse,
    ) -> Result<(), SequenceError> {
        self.publish(topic, &response.into(), PublishOptions::default())
            .await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &JsonRpcPayload,
        opts: PublishOptions,
    ) -> Result<(), SequenceError> {
        let text = serde_json::to_string(payload)?;
        let encoded = self.crypto.encode(topic, &text)?;
        self.relayer.publish(topic, &encoded, opts).await?;
        // Our own frame echoed back by the relay is a duplicate.
        self.messages.set(topic, &encoded);
        Ok(())
    }

    async fn fail_request(&self, topic: &str, id: u64, reply: bool, error: SequenceError) {
        warn!(kind = %self.kind, topic = %topic, id, error = %error, "inbound request failed");
        if reply {
            let response = JsonRpcResponse::error(id, error.to_rpc_error());
            if let Err(e) = self.send_response(topic, response).await {
                debug!(topic = %topic, error = %e, "could not report failure to peer");
            }
        }
        let _ = self.events.send(SequenceEvent::Error {
            topic: topic.to_string(),
            error: error.to_string(),
        });
    }

    async fn await_response(
        &self,
        mut responses: broadcast::Receiver<HistoryEvent>,
        topic: &str,
        id: u64,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, SequenceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(JsonRpcRecord {
                response: Some(response),
                ..
            }) = self.history.get(topic, id)
            {
                return Ok(response);
            }

            match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => {
                    debug!(kind = %self.kind, topic = %topic, id, "request timed out");
                    return Err(SequenceError::Timeout {
                        topic: topic.to_string(),
                        id,
                    });
                }
                Ok(Ok(HistoryEvent::Resolved(record))) if record.id == id => {
                    if let Some(response) = record.response {
                        return Ok(response);
                    }
                }
                Ok(Ok(HistoryEvent::Deleted(record))) if record.id == id => {
                    return Err(SequenceError::not_found("request", topic));
                }
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(SequenceError::InvalidState("history closed".into()));
                }
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_params<T: serde::de::DeserializeOwned>(request: &JsonRpcRequest) -> Result<T, SequenceError> {
    serde_json::from_value(request.params.clone()).map_err(|e| {
        SequenceError::MissingOrInvalid(format!("{} params: {}", request.method, e))
    })
}

fn ensure_one_controller(proposer: &Participant, responder: &Participant) -> Result<(), SequenceError> {
    if proposer.controller == responder.controller {
        return Err(SequenceError::InvalidParams(
            "exactly one participant must be the controller".into(),
        ));
    }
    Ok(())
}

fn authorize_request(
    permissions: &Permissions,
    method: &str,
    chain_id: Option<&str>,
) -> Result<(), SequenceError> {
    if !permissions.allows_method(method) {
        return Err(SequenceError::UnauthorizedTarget(format!("method {}", method)));
    }
    if let Some(chain) = chain_id {
        if !permissions.allows_chain(chain) {
            return Err(SequenceError::UnauthorizedTarget(format!("chain {}", chain)));
        }
    }
    Ok(())
}

/// Whether the peer tracks this method and waits for an answer.
fn expects_reply(method: SequenceMethod) -> bool {
    !matches!(
        method,
        SequenceMethod::Reject | SequenceMethod::Delete | SequenceMethod::Notification
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use tandem_transport::MemoryRelay;

    use crate::clock::ManualClock;
    use crate::harness::{dapp_and_wallet, EPOCH};

    fn participant(controller: bool) -> Participant {
        Participant {
            public_key: if controller { "aa" } else { "bb" }.repeat(32),
            controller,
            metadata: None,
        }
    }

    #[test]
    fn test_exactly_one_controller() {
        assert!(ensure_one_controller(&participant(false), &participant(true)).is_ok());
        assert!(matches!(
            ensure_one_controller(&participant(true), &participant(true)),
            Err(SequenceError::InvalidParams(_))
        ));
        assert!(ensure_one_controller(&participant(false), &participant(false)).is_err());
    }

    #[test]
    fn test_authorize_request() {
        let permissions = Permissions::new(
            Capabilities::methods(["eth_sign"]).with_chains(["eip155:1"]),
            "aa",
        );
        assert!(authorize_request(&permissions, "eth_sign", None).is_ok());
        assert!(authorize_request(&permissions, "eth_sign", Some("eip155:1")).is_ok());
        assert!(matches!(
            authorize_request(&permissions, "eth_sign", Some("eip155:10")),
            Err(SequenceError::UnauthorizedTarget(_))
        ));
        assert!(authorize_request(&permissions, "eth_call", None).is_err());
    }

    #[test]
    fn test_notices_expect_no_reply() {
        assert!(expects_reply(SequenceMethod::Ping));
        assert!(expects_reply(SequenceMethod::Approve));
        assert!(!expects_reply(SequenceMethod::Delete));
        assert!(!expects_reply(SequenceMethod::Notification));
    }

    #[tokio::test]
    async fn test_propose_records_subscribes_and_expires() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(ManualClock::new(EPOCH));
        let (dapp, _wallet) = dapp_and_wallet(&relay, clock).await.unwrap();
        let pairing = dapp.client.pairing();

        let pending = pairing.propose(ProposeParams::default()).await.unwrap();
        assert_eq!(pending.status, PendingStatus::Proposed);
        assert_eq!(pairing.get_pending(&pending.topic).unwrap(), pending);
        assert!(pairing.owns(&pending.topic));

        let Signal::Uri { uri } = &pending.proposal.signal else {
            panic!("pairing proposals carry a uri");
        };
        let parsed = PairingUri::from_str(uri).unwrap();
        assert_eq!(parsed.topic, pending.topic);
        assert_eq!(parsed.public_key, pending.self_participant.public_key);

        assert!(dapp.client.relayer().subscriber().is_subscribed(&pending.topic));
        let target = ExpiryTarget::Topic(pending.topic.clone());
        assert_eq!(
            dapp.client.expirer().get(&target).unwrap().expiry,
            EPOCH + SequenceKind::Pairing.default_proposal_ttl()
        );
    }

    #[tokio::test]
    async fn test_propose_rejects_zero_ttl() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(ManualClock::new(EPOCH));
        let (dapp, _wallet) = dapp_and_wallet(&relay, clock).await.unwrap();

        let err = dapp
            .client
            .pairing()
            .propose(ProposeParams {
                ttl: Some(0),
                ..ProposeParams::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams(_)));
        assert!(dapp.client.pairing().pending().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_validates_proposal() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(ManualClock::new(EPOCH));
        let (dapp, wallet) = dapp_and_wallet(&relay, clock).await.unwrap();
        let pending = dapp.client.pairing().propose(ProposeParams::default()).await.unwrap();

        let mut tampered = pending.proposal.clone();
        tampered.topic = "ff".repeat(32);
        let err = wallet.client.pairing().ingest_proposal(tampered).await.unwrap_err();
        assert!(matches!(err, SequenceError::MissingOrInvalid(_)));

        let mut wrong_signal = pending.proposal.clone();
        wrong_signal.signal = Signal::Pairing {
            topic: "ab".repeat(32),
        };
        let err = wallet.client.pairing().ingest_proposal(wrong_signal).await.unwrap_err();
        assert!(matches!(err, SequenceError::UnsupportedSignal { .. }));

        let received = wallet
            .client
            .pairing()
            .ingest_proposal(pending.proposal.clone())
            .await
            .unwrap();
        assert!(received.self_participant.controller);
        assert_ne!(received.self_participant.public_key, pending.self_participant.public_key);

        let err = wallet
            .client
            .pairing()
            .ingest_proposal(pending.proposal)
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_settled_operations_need_a_settled_topic() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(ManualClock::new(EPOCH));
        let (dapp, _wallet) = dapp_and_wallet(&relay, clock).await.unwrap();
        let session = dapp.client.session();
        let topic = "cd".repeat(32);

        assert!(matches!(
            session.ping(&topic, None).await,
            Err(SequenceError::NotFound { .. })
        ));
        assert!(matches!(
            session.update(&topic, SequenceState::new()).await,
            Err(SequenceError::NotFound { .. })
        ));
        assert!(matches!(
            session.delete(&topic, Reason::user_disconnected()).await,
            Err(SequenceError::NotFound { .. })
        ));
    }

    async fn wait_for_unlocked(engine: &SequenceEngine) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.locks.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_topic_locks_released_after_settle_and_peer_delete() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(ManualClock::new(EPOCH));
        let (dapp, wallet) = dapp_and_wallet(&relay, clock).await.unwrap();
        let topic = crate::harness::pair(&dapp.client, &wallet.client).await.unwrap();

        // Only the settled topic is owned now; the proposal lock is gone.
        wait_for_unlocked(dapp.client.pairing()).await;
        wait_for_unlocked(wallet.client.pairing()).await;

        let mut dapp_events = dapp.client.pairing().subscribe();
        wallet
            .client
            .pairing()
            .delete(&topic, Reason::user_disconnected())
            .await
            .unwrap();
        crate::harness::next_event(&mut dapp_events, |e| matches!(e, SequenceEvent::Deleted { .. }))
            .await
            .unwrap();

        wait_for_unlocked(dapp.client.pairing()).await;
        assert!(!dapp.client.pairing().owns(&topic));
        assert!(wallet.client.pairing().locks.is_empty());
    }

    #[tokio::test]
    async fn test_settlement_forgets_both_key_pairs() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(ManualClock::new(EPOCH));
        let (dapp, wallet) = dapp_and_wallet(&relay, clock).await.unwrap();
        let topic = crate::harness::pair(&dapp.client, &wallet.client).await.unwrap();

        assert_eq!(dapp.crypto.key_pair_count(), 0);
        assert_eq!(wallet.crypto.key_pair_count(), 0);
        assert!(dapp.crypto.has_key(&topic));
        assert!(wallet.crypto.has_key(&topic));
    }
}
