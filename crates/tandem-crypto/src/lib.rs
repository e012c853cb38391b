//! Tandem crypto - the key material collaborator consumed by the sequence engine.
//!
//! This crate provides:
//! - The `Crypto` trait the core depends on
//! - `KeyChain`, an in-process implementation backed by X25519 key agreement,
//!   HKDF-SHA256 derivation and ChaCha20-Poly1305 envelopes
//! - Hash helpers for topic derivation and message fingerprints

#![forbid(unsafe_code)]

pub mod envelope;
pub mod hash;
pub mod keychain;

pub use keychain::{Crypto, CryptoError, KeyChain, KeyHandle};
