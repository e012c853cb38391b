//! Per-kind policy of the sequence engine.
//!
//! Pairing and session share one state machine. Everything that differs
//! between them is selected here from `SequenceKind`.

use std::fmt;

use crate::errors::SequenceError;
use crate::sequence::types::{Capabilities, Signal};

const DAY: u64 = 24 * 60 * 60;

/// Method session proposals travel under, wrapped in a pairing payload.
pub const SESSION_PROPOSE_METHOD: &str = "wc_sessionPropose";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    Pairing,
    Session,
}

/// Protocol methods exchanged between the two participants of a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceMethod {
    Approve,
    Reject,
    Upgrade,
    Update,
    Extend,
    Delete,
    Ping,
    Payload,
    Notification,
}

impl SequenceMethod {
    const ALL: [SequenceMethod; 9] = [
        SequenceMethod::Approve,
        SequenceMethod::Reject,
        SequenceMethod::Upgrade,
        SequenceMethod::Update,
        SequenceMethod::Extend,
        SequenceMethod::Delete,
        SequenceMethod::Ping,
        SequenceMethod::Payload,
        SequenceMethod::Notification,
    ];

    fn suffix(self) -> &'static str {
        match self {
            SequenceMethod::Approve => "Approve",
            SequenceMethod::Reject => "Reject",
            SequenceMethod::Upgrade => "Upgrade",
            SequenceMethod::Update => "Update",
            SequenceMethod::Extend => "Extend",
            SequenceMethod::Delete => "Delete",
            SequenceMethod::Ping => "Ping",
            SequenceMethod::Payload => "Payload",
            SequenceMethod::Notification => "Notification",
        }
    }
}

impl SequenceKind {
    pub fn name(self) -> &'static str {
        match self {
            SequenceKind::Pairing => "pairing",
            SequenceKind::Session => "session",
        }
    }

    /// Wire method name, e.g. `wc_sessionUpdate`.
    pub fn method(self, method: SequenceMethod) -> String {
        format!("wc_{}{}", self.name(), method.suffix())
    }

    /// Parse a wire method name belonging to this kind.
    pub fn parse_method(self, method: &str) -> Option<SequenceMethod> {
        let prefix = format!("wc_{}", self.name());
        let suffix = method.strip_prefix(&prefix)?;
        SequenceMethod::ALL
            .into_iter()
            .find(|m| m.suffix() == suffix)
    }

    pub fn default_proposal_ttl(self) -> u64 {
        match self {
            SequenceKind::Pairing => 30 * DAY,
            SequenceKind::Session => DAY,
        }
    }

    pub fn default_settled_ttl(self) -> u64 {
        match self {
            SequenceKind::Pairing => 30 * DAY,
            SequenceKind::Session => 7 * DAY,
        }
    }

    /// Capabilities every sequence of this kind needs.
    pub fn default_capabilities(self) -> Capabilities {
        match self {
            SequenceKind::Pairing => Capabilities::methods([SESSION_PROPOSE_METHOD]),
            SequenceKind::Session => Capabilities::default(),
        }
    }

    pub fn expected_signal(self) -> &'static str {
        match self {
            SequenceKind::Pairing => "uri",
            SequenceKind::Session => "pairing",
        }
    }

    pub fn validate_signal(self, signal: &Signal) -> Result<(), SequenceError> {
        if signal.method() != self.expected_signal() {
            return Err(SequenceError::UnsupportedSignal {
                expected: self.expected_signal().to_string(),
                actual: signal.method().to_string(),
            });
        }
        Ok(())
    }

    pub fn pending_context(self) -> String {
        format!("{}:pending", self.name())
    }

    pub fn settled_context(self) -> String {
        format!("{}:settled", self.name())
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
