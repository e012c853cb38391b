//! Relay-level JSON-RPC methods.
//!
//! These frames travel between the client and the relay itself. They carry
//! already-encrypted payloads and never see plaintext.

use serde::{Deserialize, Serialize};

/// Default time the relay retains an undelivered message, in seconds.
pub const DEFAULT_PUBLISH_TTL: u64 = 6 * 60 * 60;

/// Options attached to a publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Relay retention for undelivered messages, in seconds
    pub ttl: u64,
    /// Whether the receiving wallet should be woken up
    pub prompt: bool,
    /// Application tag, opaque to the relay
    pub tag: u32,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_PUBLISH_TTL,
            prompt: false,
            tag: 0,
        }
    }
}

/// Requests understood by the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RelayRequest {
    #[serde(rename = "irn_publish")]
    Publish {
        topic: String,
        message: String,
        ttl: u64,
        prompt: bool,
        tag: u32,
    },
    #[serde(rename = "irn_subscribe")]
    Subscribe { topic: String },
    #[serde(rename = "irn_unsubscribe")]
    Unsubscribe { topic: String, id: String },
}

impl RelayRequest {
    /// Build a publish frame.
    pub fn publish(topic: &str, message: &str, opts: &PublishOptions) -> Self {
        RelayRequest::Publish {
            topic: topic.to_string(),
            message: message.to_string(),
            ttl: opts.ttl,
            prompt: opts.prompt,
            tag: opts.tag,
        }
    }

    /// Wire method name.
    pub fn method(&self) -> &'static str {
        match self {
            RelayRequest::Publish { .. } => "irn_publish",
            RelayRequest::Subscribe { .. } => "irn_subscribe",
            RelayRequest::Unsubscribe { .. } => "irn_unsubscribe",
        }
    }

    /// Topic the request refers to.
    pub fn topic(&self) -> &str {
        match self {
            RelayRequest::Publish { topic, .. }
            | RelayRequest::Subscribe { topic }
            | RelayRequest::Unsubscribe { topic, .. } => topic,
        }
    }
}

/// Relay answers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayResponse {
    /// Subscription id assigned by the relay
    Subscribed { id: String },
    /// Plain acknowledgement
    Ack(bool),
}

impl RelayResponse {
    /// Subscription id, if this answers a subscribe.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayResponse::Subscribed { id } => Some(id),
            RelayResponse::Ack(_) => None,
        }
    }
}
