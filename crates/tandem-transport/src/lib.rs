//! Relay transport abstractions for the Tandem client.
//!
//! This crate provides the transport provider seam consumed by the relayer,
//! without any socket-level dependency:
//! - `RelayTransport`, the opaque duplex channel to the relay
//! - The typed relay wire protocol (`irn_publish`, `irn_subscribe`, `irn_unsubscribe`)
//! - Connection state tracking and exponential backoff
//! - `MemoryRelay`, an in-process relay with fault injection for tests

pub mod traits;
pub mod protocol;
pub mod connection;
pub mod testing;

pub use traits::*;
pub use protocol::*;
pub use connection::*;
pub use testing::*;
