//! Inbound message deduplication.
//!
//! The relay delivers at least once. Each accepted message is fingerprinted
//! per topic so redeliveries can be dropped before decoding.

use std::collections::HashSet;

use dashmap::DashMap;
use tandem_crypto::hash::message_hash;

#[derive(Default)]
pub struct MessageTracker {
    hashes: DashMap<String, HashSet<String>>,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message. Returns `false` if it was already seen on the topic.
    pub fn set(&self, topic: &str, message: &str) -> bool {
        self.hashes
            .entry(topic.to_string())
            .or_default()
            .insert(message_hash(message))
    }

    pub fn has(&self, topic: &str, message: &str) -> bool {
        self.hashes
            .get(topic)
            .map(|set| set.contains(&message_hash(message)))
            .unwrap_or(false)
    }

    /// Forget every fingerprint for the topic.
    pub fn delete(&self, topic: &str) {
        self.hashes.remove(topic);
    }

    pub fn topic_count(&self) -> usize {
        self.hashes.len()
    }
}
