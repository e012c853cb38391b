//! Tandem Core - session protocol client state machines and plumbing.
//!
//! This crate implements:
//! - The sequence engine driving pairing and session lifecycles
//! - The relayer (publisher, subscriber, reconnect handling)
//! - JSON-RPC history correlating requests with responses
//! - The expirer and heartbeat
//! - Persistent key-value store abstraction
//! - Inbound message dispatch and the client facade

#![forbid(unsafe_code)]

// Core state machines
pub mod sequence;

// Services
pub mod relayer;
pub mod dispatch;
pub mod client;

// Infrastructure
pub mod store;
pub mod storage;
pub mod history;
pub mod expirer;
pub mod heartbeat;

// Supporting modules
pub mod config;
pub mod errors;
pub mod jsonrpc;
pub mod clock;
pub mod locks;
pub mod messages;
pub mod uri;
pub mod harness;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use client::{Client, ClientDeps};
pub use config::ClientConfig;
pub use errors::{ClientError, Reason, SequenceError};
