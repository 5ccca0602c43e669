//! Cryptographic primitives for kpx.
//!
//! This crate provides:
//! - Curve25519 key pairs for session and identification keys
//! - NaCl box encryption (`crypto_box` / XSalsa20-Poly1305)
//! - A nonce sequencer that never hands out the same nonce twice
//! - An injectable entropy capability so sessions can run deterministically in tests
//!
//! # Design
//!
//! The proxy protocol uses one shared box key per connection, derived from our
//! ephemeral secret and the proxy's ephemeral public key. Both directions use the
//! same key, so both directions must draw their nonces from the same sequence:
//! a request uses nonce `n` and the proxy answers with `n + 1`.

#![forbid(unsafe_code)]

pub mod entropy;
pub mod keys;
pub mod nacl;
pub mod nonce;

pub use entropy::{EntropySource, OsEntropy};
pub use keys::{KeyPair, PublicKey};
pub use nacl::{decrypt, encrypt, random_nonce};
pub use nonce::{Nonce, NonceSequencer, NONCE_SIZE};

use thiserror::Error;

/// Size of Curve25519 public and secret keys.
pub const KEY_SIZE: usize = 32;

/// Errors from the crypto layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The authentication tag did not verify. Nothing was decrypted.
    #[error("authentication failed: message could not be decrypted")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid nonce length: expected 24 bytes, got {0}")]
    InvalidNonce(usize),

    /// The nonce counter wrapped around; the session must not encrypt again.
    #[error("nonce space exhausted")]
    NonceExhausted,
}
