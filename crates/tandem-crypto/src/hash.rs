use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Topic derivation: topic = hex(sha256(sym_key)).
pub fn derive_topic(sym_key: &[u8]) -> String {
    hex::encode(sha256(sym_key))
}

/// Fingerprint of an encoded relay message, used for inbound deduplication.
pub fn message_hash(message: &str) -> String {
    hex::encode(sha256(message.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_hex_sha256() {
        let topic = derive_topic(&[7u8; 32]);
        assert_eq!(topic.len(), 64);
        assert_eq!(topic, hex::encode(sha256(&[7u8; 32])));
    }

    #[test]
    fn message_hash_differs_per_message() {
        assert_ne!(message_hash("a"), message_hash("b"));
        assert_eq!(message_hash("a"), message_hash("a"));
    }
}
