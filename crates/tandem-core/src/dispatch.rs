//! Inbound routing.
//!
//! One task drains the relayer and the expirer. Relay messages are
//! deduplicated, decoded and handed to the engine that owns their topic.
//! Responses resolve the history before the engine sees them. Expired
//! topics are torn down here too. An expired request id only means the
//! request is overdue; its record stays so a late answer is still kept.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tandem_crypto::Crypto;
use tandem_transport::RelayMessage;

use crate::errors::{HistoryError, SequenceError};
use crate::expirer::{Expiration, ExpirerEvent, ExpiryTarget};
use crate::history::JsonRpcHistory;
use crate::jsonrpc::{JsonRpcPayload, JsonRpcRequest, JsonRpcResponse};
use crate::messages::MessageTracker;
use crate::relayer::RelayerEvent;
use crate::sequence::{
    EngineDeps, PayloadParams, Proposal, SequenceEngine, SequenceKind, SequenceMethod, Signal,
    SESSION_PROPOSE_METHOD,
};

pub struct Dispatcher {
    crypto: Arc<dyn Crypto>,
    history: Arc<JsonRpcHistory>,
    messages: Arc<MessageTracker>,
    pairing: Arc<SequenceEngine>,
    session: Arc<SequenceEngine>,
}

impl Dispatcher {
    pub fn new(deps: &EngineDeps, pairing: Arc<SequenceEngine>, session: Arc<SequenceEngine>) -> Self {
        Self {
            crypto: deps.crypto.clone(),
            history: deps.history.clone(),
            messages: deps.messages.clone(),
            pairing,
            session,
        }
    }

    /// Run the dispatch loop until either source closes.
    ///
    /// Receivers are taken by the caller so nothing published between
    /// construction and spawn is missed.
    pub fn spawn(
        self: &Arc<Self>,
        mut relay_events: broadcast::Receiver<RelayerEvent>,
        mut expirations: broadcast::Receiver<ExpirerEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = relay_events.recv() => match event {
                        Ok(RelayerEvent::Message(message)) => this.handle_message(message).await,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "dispatcher fell behind the relayer");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = expirations.recv() => match event {
                        Ok(ExpirerEvent::Expired(expiration)) => this.handle_expired(expiration).await,
                        Ok(ExpirerEvent::Created(_)) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "dispatcher fell behind the expirer");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("dispatcher stopped");
        })
    }

    /// Route one still-encoded relay message.
    pub async fn handle_message(&self, message: RelayMessage) {
        let RelayMessage { topic, message } = message;
        let Some(engine) = self.owner(&topic) else {
            debug!(topic = %topic, "message for unknown topic");
            return;
        };
        if !self.messages.set(&topic, &message) {
            debug!(topic = %topic, "duplicate message dropped");
            return;
        }
        let decoded = match self.crypto.decode(&topic, &message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to decode message");
                return;
            }
        };
        let payload: JsonRpcPayload = match serde_json::from_str(&decoded) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "malformed json-rpc payload");
                return;
            }
        };

        match payload {
            JsonRpcPayload::Request(request) => {
                if engine.kind() == SequenceKind::Pairing && is_session_proposal(&request) {
                    self.forward_session_proposal(&topic, request).await;
                } else {
                    engine.on_request(&topic, request).await;
                }
            }
            JsonRpcPayload::Response(response) => match self.history.resolve(&response).await {
                Ok(record) => engine.on_response(&topic, record).await,
                Err(HistoryError::AlreadyResolved(id)) => {
                    debug!(topic = %topic, id, "response already recorded");
                }
                Err(e) => warn!(topic = %topic, id = response.id(), error = %e, "unexpected response"),
            },
        }
    }

    pub async fn handle_expired(&self, expiration: Expiration) {
        match &expiration.target {
            ExpiryTarget::Topic(topic) => {
                let Some(engine) = self.owner(topic) else {
                    return;
                };
                if let Err(e) = engine.on_expired(topic).await {
                    warn!(topic = %topic, error = %e, "failed to expire sequence");
                }
            }
            ExpiryTarget::Id(id) => {
                if let Some(record) = self.history.pending().into_iter().find(|r| r.id == *id) {
                    debug!(topic = %record.topic, id, method = %record.request.method, "request overdue");
                }
            }
        }
    }

    fn owner(&self, topic: &str) -> Option<&Arc<SequenceEngine>> {
        if self.session.owns(topic) {
            Some(&self.session)
        } else if self.pairing.owns(topic) {
            Some(&self.pairing)
        } else {
            None
        }
    }

    /// A session proposal arrives wrapped in a pairing payload. The pairing
    /// acknowledges receipt; approval travels on the proposal topic.
    async fn forward_session_proposal(&self, topic: &str, request: JsonRpcRequest) {
        let result = self.ingest_session_proposal(topic, &request).await;
        let response = match result {
            Ok(()) => JsonRpcResponse::result(request.id, json!(true)),
            Err(e) => {
                warn!(topic = %topic, error = %e, "session proposal refused");
                JsonRpcResponse::error(request.id, e.to_rpc_error())
            }
        };
        if let Err(e) = self.pairing.reply(topic, response).await {
            warn!(topic = %topic, error = %e, "failed to acknowledge session proposal");
        }
    }

    async fn ingest_session_proposal(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), SequenceError> {
        let pairing = self.pairing.get(topic)?;
        let params: PayloadParams = serde_json::from_value(request.params.clone())
            .map_err(|e| SequenceError::MissingOrInvalid(e.to_string()))?;
        if !pairing.permissions.allows_method(&params.request.method) {
            return Err(SequenceError::UnauthorizedTarget(format!(
                "method {}",
                params.request.method
            )));
        }

        let proposal: Proposal = serde_json::from_value(params.request.params)
            .map_err(|e| SequenceError::MissingOrInvalid(e.to_string()))?;
        match &proposal.signal {
            Signal::Pairing { topic: signalled } if signalled == topic => {}
            _ => {
                return Err(SequenceError::MissingOrInvalid(
                    "session proposal does not signal over this pairing".into(),
                ))
            }
        }
        self.session.ingest_proposal(proposal).await?;
        Ok(())
    }
}

fn is_session_proposal(request: &JsonRpcRequest) -> bool {
    if SequenceKind::Pairing.parse_method(&request.method) != Some(SequenceMethod::Payload) {
        return false;
    }
    request
        .params
        .get("request")
        .and_then(|inner| inner.get("method"))
        .and_then(|method| method.as_str())
        == Some(SESSION_PROPOSE_METHOD)
}
