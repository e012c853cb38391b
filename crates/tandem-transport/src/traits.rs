//! Transport provider trait and events.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::{RelayRequest, RelayResponse};

/// A message delivered by the relay for one of our subscriptions.
///
/// `message` is the still-encoded payload exactly as published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub message: String,
}

/// Events emitted by a transport provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(RelayMessage),
}

/// Opaque duplex channel to the relay.
///
/// Each outbound request is a complete, independently-parsable frame, so
/// concurrent callers never interleave partial frames.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open the connection. Emits `TransportEvent::Connected` on success.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Emits `TransportEvent::Disconnected`.
    async fn close(&self) -> Result<(), TransportError>;

    /// Send a relay-level request and wait for the relay's response.
    async fn request(&self, request: RelayRequest) -> Result<RelayResponse, TransportError>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;

    /// Subscribe to connection and message events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Common transport error type
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("Relay rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected relay response to {0}")]
    UnexpectedResponse(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Other(_))
    }
}
