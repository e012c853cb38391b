//! Error types for Tandem core.
//!
//! Each component owns one error enum. `SequenceError` additionally maps
//! onto JSON-RPC error objects so failures can be reported to the peer with
//! stable codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tandem_crypto::CryptoError;
use tandem_transport::TransportError;

use crate::jsonrpc::ErrorObject;

// ============================================================================
// Reasons
// ============================================================================

/// Why a record went away, or why a peer refused something.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i64,
    pub message: String,
}

impl Reason {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_disconnected() -> Self {
        Self::new(codes::USER_DISCONNECTED, "User disconnected")
    }

    pub fn expired() -> Self {
        Self::new(codes::EXPIRED, "Expired")
    }

    pub fn settle_failed(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::SETTLE_FAILED, format!("Settlement failed: {}", detail))
    }

    pub fn user_rejected() -> Self {
        Self::new(codes::USER_REJECTED, "User rejected")
    }

    pub fn settled() -> Self {
        Self::new(codes::SETTLED, "Settled")
    }
}

impl From<ErrorObject> for Reason {
    fn from(e: ErrorObject) -> Self {
        Self::new(e.code, e.message)
    }
}

/// Stable numeric codes shared with peers.
pub mod codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const MISSING_OR_INVALID: i64 = 1000;
    pub const UNSUPPORTED_SIGNAL: i64 = 1001;
    pub const NOT_FOUND: i64 = 1300;
    pub const INVALID_EXTEND_REQUEST: i64 = 1400;
    pub const UNAUTHORIZED: i64 = 3000;
    pub const UNAUTHORIZED_TARGET: i64 = 3001;
    pub const USER_REJECTED: i64 = 5000;
    pub const SETTLE_FAILED: i64 = 5200;
    pub const SETTLED: i64 = 5300;
    pub const USER_DISCONNECTED: i64 = 6000;
    pub const EXPIRED: i64 = 6001;
    pub const TIMEOUT: i64 = 8000;
}

// ============================================================================
// Storage and Store
// ============================================================================

/// Errors raised by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend failed: {0}")]
    Backend(String),

    #[error("storage serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised by [`crate::store::Store`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no {context} record for key {key}")]
    NotFound { context: String, key: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("record serialization failed: {0}")]
    Serialization(String),
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// A record with this id is already registered
    #[error("duplicate request id {0}")]
    DuplicateId(u64),

    /// No record for the response id
    #[error("no request record for id {0}")]
    RecordNotFound(u64),

    /// The record already carries a response
    #[error("request {0} already resolved")]
    AlreadyResolved(u64),

    /// The record exists but belongs to another topic
    #[error("request {id} belongs to topic {actual}, not {expected}")]
    TopicMismatch {
        id: u64,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Expirer
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpirerError {
    #[error("no expiry registered for {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Relayer
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayerError {
    /// Publish retries exhausted
    #[error("publish to {topic} failed after {attempts} attempts: {last_error}")]
    PublishFailure {
        topic: String,
        attempts: u32,
        last_error: TransportError,
    },

    /// Subscribe retries exhausted, or the relay answered without an id
    #[error("subscribe to {topic} failed: {detail}")]
    SubscribeFailed { topic: String, detail: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// URI
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("malformed uri: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unexpected uri scheme {0}")]
    Scheme(String),

    #[error("uri is missing {0}")]
    MissingField(&'static str),

    #[error("uri field {field} has invalid value {value}")]
    InvalidField { field: &'static str, value: String },
}

// ============================================================================
// Sequence
// ============================================================================

/// Errors surfaced by the sequence engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SequenceError {
    /// Caller-supplied data failed validation
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Proposal params absent or malformed
    #[error("missing or invalid: {0}")]
    MissingOrInvalid(String),

    /// The proposal signal does not match the sequence kind
    #[error("unsupported signal: expected {expected}, got {actual}")]
    UnsupportedSignal { expected: String, actual: String },

    #[error("no {kind} for topic {topic}")]
    NotFound { kind: String, topic: String },

    /// Only the controller may perform this operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The settled permissions do not allow this method, chain or notification
    #[error("unauthorized target: {0}")]
    UnauthorizedTarget(String),

    /// Extension must strictly increase the expiry
    #[error("invalid extend request: {requested} is not after {current}")]
    InvalidExtendRequest { current: u64, requested: u64 },

    /// The record is in the wrong lifecycle state for the operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("request {id} on {topic} timed out")]
    Timeout { topic: String, id: u64 },

    /// The peer answered with an error response
    #[error("peer error {code}: {message}")]
    Peer { code: i64, message: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Expirer(#[from] ExpirerError),

    #[error(transparent)]
    Relayer(#[from] RelayerError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SequenceError {
    fn from(e: serde_json::Error) -> Self {
        SequenceError::Serialization(e.to_string())
    }
}

impl SequenceError {
    /// Stable wire code for the error.
    pub fn code(&self) -> i64 {
        match self {
            SequenceError::InvalidParams(_) => codes::INVALID_PARAMS,
            SequenceError::MissingOrInvalid(_) => codes::MISSING_OR_INVALID,
            SequenceError::UnsupportedSignal { .. } => codes::UNSUPPORTED_SIGNAL,
            SequenceError::NotFound { .. } => codes::NOT_FOUND,
            SequenceError::Unauthorized(_) => codes::UNAUTHORIZED,
            SequenceError::UnauthorizedTarget(_) => codes::UNAUTHORIZED_TARGET,
            SequenceError::InvalidExtendRequest { .. } => codes::INVALID_EXTEND_REQUEST,
            SequenceError::Timeout { .. } => codes::TIMEOUT,
            SequenceError::Peer { code, .. } => *code,
            SequenceError::Serialization(_) => codes::INVALID_PARAMS,
            SequenceError::InvalidState(_)
            | SequenceError::Crypto(_)
            | SequenceError::Store(_)
            | SequenceError::History(_)
            | SequenceError::Expirer(_)
            | SequenceError::Relayer(_)
            | SequenceError::Uri(_) => codes::INTERNAL,
        }
    }

    /// Map to a JSON-RPC error object for the peer.
    ///
    /// Internal failures are reported without detail.
    pub fn to_rpc_error(&self) -> ErrorObject {
        let code = self.code();
        let message = match self {
            SequenceError::Peer { message, .. } => message.clone(),
            _ if code == codes::INTERNAL => "Internal error".to_string(),
            _ => self.to_string(),
        };
        ErrorObject { code, message }
    }

    pub(crate) fn not_found(kind: impl Into<String>, topic: impl Into<String>) -> Self {
        SequenceError::NotFound {
            kind: kind.into(),
            topic: topic.into(),
        }
    }
}

impl From<ErrorObject> for SequenceError {
    fn from(e: ErrorObject) -> Self {
        SequenceError::Peer {
            code: e.code,
            message: e.message,
        }
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relayer(#[from] RelayerError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Uri(#[from] UriError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_hide_detail() {
        let err = SequenceError::Store(StoreError::Serialization("disk on fire".into()));
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, codes::INTERNAL);
        assert!(!rpc.message.contains("disk"));
    }

    #[test]
    fn caller_errors_keep_their_codes() {
        let err = SequenceError::InvalidExtendRequest {
            current: 10,
            requested: 5,
        };
        assert_eq!(err.to_rpc_error().code, codes::INVALID_EXTEND_REQUEST);
        assert_eq!(
            SequenceError::UnauthorizedTarget("eth_sign".into()).code(),
            codes::UNAUTHORIZED_TARGET
        );
    }

    #[test]
    fn peer_errors_round_trip_their_code() {
        let obj = ErrorObject {
            code: codes::USER_REJECTED,
            message: "no thanks".into(),
        };
        let err = SequenceError::from(obj.clone());
        assert_eq!(err.to_rpc_error(), obj);
    }
}
