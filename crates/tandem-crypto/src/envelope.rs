//! Envelope encoding for relay payloads.
//!
//! Wire layout (before base64):
//! `type(1) || nonce(12) || ciphertext+tag`
//!
//! Only envelope type 0 (symmetric key known to both peers) is produced.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

/// Envelope type for payloads sealed with a pre-shared symmetric key.
pub const TYPE_0: u8 = 0;

const NONCE_LEN: usize = 12;

/// Error type for envelope operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid base64")]
    InvalidEncoding,
    #[error("envelope too short")]
    Truncated,
    #[error("unsupported envelope type {0}")]
    UnsupportedType(u8),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("RNG failed")]
    Rng,
}

/// Seal `plaintext` under `key` with a random nonce.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<String, EnvelopeError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| EnvelopeError::Rng)?;

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let ct = aead
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ct.len());
    out.push(TYPE_0);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(B64.encode(out))
}

/// Open an envelope produced by [`seal`].
pub fn open(key: &[u8; 32], encoded: &str) -> Result<Vec<u8>, EnvelopeError> {
    let blob = B64
        .decode(encoded.as_bytes())
        .map_err(|_| EnvelopeError::InvalidEncoding)?;
    if blob.len() < 1 + NONCE_LEN {
        return Err(EnvelopeError::Truncated);
    }
    if blob[0] != TYPE_0 {
        return Err(EnvelopeError::UnsupportedType(blob[0]));
    }
    let (nonce, ct) = blob[1..].split_at(NONCE_LEN);

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    aead.decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| EnvelopeError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = seal(&[1u8; 32], b"hello").unwrap();
        assert_eq!(open(&[2u8; 32], &sealed), Err(EnvelopeError::DecryptFailed));
    }

    #[test]
    fn open_rejects_unknown_type() {
        let mut raw = vec![9u8];
        raw.extend_from_slice(&[0u8; 40]);
        let encoded = B64.encode(raw);
        assert_eq!(open(&[1u8; 32], &encoded), Err(EnvelopeError::UnsupportedType(9)));
    }

    #[test]
    fn open_rejects_truncated() {
        let encoded = B64.encode([0u8; 5]);
        assert_eq!(open(&[1u8; 32], &encoded), Err(EnvelopeError::Truncated));
    }

    #[test]
    fn nonces_are_fresh() {
        let a = seal(&[1u8; 32], b"same").unwrap();
        let b = seal(&[1u8; 32], b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(open(&[1u8; 32], &a).unwrap(), b"same");
    }
}
