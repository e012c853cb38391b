//! Pairing and session lifecycles.
//!
//! Both are instances of one engine, parameterised by [`SequenceKind`].

pub mod engine;
pub mod policy;
pub mod types;

pub use engine::{EngineConfig, EngineDeps, SequenceEngine, DEFAULT_REQUEST_TIMEOUT};
pub use policy::{SequenceKind, SequenceMethod, SESSION_PROPOSE_METHOD};
pub use types::*;
