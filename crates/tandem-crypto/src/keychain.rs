//! Key management for pairing and session topics.
//!
//! Every encrypted channel is addressed by a topic derived from its
//! symmetric key. The keychain keeps:
//! - X25519 key pairs indexed by hex public key
//! - 32-byte symmetric keys indexed by topic

use std::collections::HashMap;
use std::fmt;

use hkdf::Hkdf;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::envelope::{self, EnvelopeError};
use crate::hash::derive_topic;

const SHARED_KEY_INFO: &[u8] = b"tandem_shared_key_v1";

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by the crypto collaborator.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No symmetric key is registered for the topic
    #[error("no key registered for topic {0}")]
    KeyNotFound(String),

    /// No private key is registered for the public key
    #[error("no key pair registered for public key {0}")]
    KeyPairNotFound(String),

    /// Key material is not valid hex of the expected length
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Envelope sealing or opening failed
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Decrypted payload is not UTF-8
    #[error("payload is not valid UTF-8")]
    InvalidPayload,

    /// Key derivation failed
    #[error("key derivation failed")]
    Derivation,

    /// OS randomness unavailable
    #[error("RNG failed")]
    Rng,
}

// ============================================================================
// Key Handle
// ============================================================================

/// Opaque reference to a symmetric key held by the keychain.
///
/// The handle's string form is the topic derived from the key, so two peers
/// that derived the same shared key hold equal handles.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyHandle(String);

impl KeyHandle {
    /// Topic addressed by this key.
    pub fn topic(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHandle({})", self.0)
    }
}

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Crypto Trait
// ============================================================================

/// Key material and payload encoding consumed by the sequence engine.
///
/// Implementations are in-process and never suspend.
pub trait Crypto: Send + Sync {
    /// Generate an X25519 key pair and return the hex public key.
    fn generate_key_pair(&self) -> Result<String, CryptoError>;

    /// Generate a random symmetric key. Returns its handle and hex encoding.
    fn generate_sym_key(&self) -> Result<(KeyHandle, String), CryptoError>;

    /// Register a symmetric key received from a peer.
    fn set_sym_key(&self, sym_key: &str) -> Result<KeyHandle, CryptoError>;

    /// Derive the shared key between one of our key pairs and a peer public key.
    fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
    ) -> Result<KeyHandle, CryptoError>;

    /// Whether a symmetric key is registered for the topic.
    fn has_key(&self, topic: &str) -> bool;

    /// Encrypt a payload for the topic.
    fn encode(&self, topic: &str, payload: &str) -> Result<String, CryptoError>;

    /// Decrypt a payload received on the topic.
    fn decode(&self, topic: &str, encoded: &str) -> Result<String, CryptoError>;

    /// Forget the symmetric key for the topic. Missing keys are ignored.
    fn delete_key(&self, topic: &str) -> Result<(), CryptoError>;

    /// Forget a key pair. Missing key pairs are ignored.
    fn delete_key_pair(&self, public_key: &str) -> Result<(), CryptoError>;
}

// ============================================================================
// KeyChain
// ============================================================================

/// In-memory keychain.
#[derive(Default)]
pub struct KeyChain {
    key_pairs: RwLock<HashMap<String, Zeroizing<[u8; 32]>>>,
    sym_keys: RwLock<HashMap<String, Zeroizing<[u8; 32]>>>,
}

impl KeyChain {
    /// Create an empty keychain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of symmetric keys currently held.
    pub fn sym_key_count(&self) -> usize {
        self.sym_keys.read().len()
    }

    /// Number of key pairs currently held.
    pub fn key_pair_count(&self) -> usize {
        self.key_pairs.read().len()
    }

    fn random32() -> Result<[u8; 32], CryptoError> {
        let mut b = [0u8; 32];
        getrandom::getrandom(&mut b).map_err(|_| CryptoError::Rng)?;
        Ok(b)
    }

    fn parse32(hex_str: &str) -> Result<[u8; 32], CryptoError> {
        let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32 bytes".into()))
    }

    fn insert_sym_key(&self, key: [u8; 32]) -> KeyHandle {
        let topic = derive_topic(&key);
        self.sym_keys
            .write()
            .insert(topic.clone(), Zeroizing::new(key));
        KeyHandle(topic)
    }

    fn sym_key(&self, topic: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.sym_keys
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| CryptoError::KeyNotFound(topic.to_string()))
    }
}

impl Crypto for KeyChain {
    fn generate_key_pair(&self) -> Result<String, CryptoError> {
        let secret_bytes = Self::random32()?;
        let secret = StaticSecret::from(secret_bytes);
        let public_key = hex::encode(PublicKey::from(&secret).to_bytes());
        self.key_pairs
            .write()
            .insert(public_key.clone(), Zeroizing::new(secret_bytes));
        Ok(public_key)
    }

    fn generate_sym_key(&self) -> Result<(KeyHandle, String), CryptoError> {
        let key = Self::random32()?;
        let exported = hex::encode(key);
        Ok((self.insert_sym_key(key), exported))
    }

    fn set_sym_key(&self, sym_key: &str) -> Result<KeyHandle, CryptoError> {
        let key = Self::parse32(sym_key)?;
        Ok(self.insert_sym_key(key))
    }

    fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
    ) -> Result<KeyHandle, CryptoError> {
        let secret_bytes = self
            .key_pairs
            .read()
            .get(self_public_key)
            .cloned()
            .ok_or_else(|| CryptoError::KeyPairNotFound(self_public_key.to_string()))?;
        let peer = PublicKey::from(Self::parse32(peer_public_key)?);

        let secret = StaticSecret::from(*secret_bytes);
        let dh = secret.diffie_hellman(&peer);

        let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(SHARED_KEY_INFO, &mut key)
            .map_err(|_| CryptoError::Derivation)?;

        let handle = self.insert_sym_key(key);
        debug!(topic = %handle, "derived shared key");
        Ok(handle)
    }

    fn has_key(&self, topic: &str) -> bool {
        self.sym_keys.read().contains_key(topic)
    }

    fn encode(&self, topic: &str, payload: &str) -> Result<String, CryptoError> {
        let key = self.sym_key(topic)?;
        Ok(envelope::seal(&key, payload.as_bytes())?)
    }

    fn decode(&self, topic: &str, encoded: &str) -> Result<String, CryptoError> {
        let key = self.sym_key(topic)?;
        let plaintext = envelope::open(&key, encoded)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidPayload)
    }

    fn delete_key(&self, topic: &str) -> Result<(), CryptoError> {
        self.sym_keys.write().remove(topic);
        Ok(())
    }

    fn delete_key_pair(&self, public_key: &str) -> Result<(), CryptoError> {
        self.key_pairs.write().remove(public_key);
        Ok(())
    }
}
