//! Nonce sequencing.
//!
//! A box nonce must never be used twice under the same key. Each session owns
//! one [`NonceSequencer`], seeded with a random value, which hands out a strictly
//! increasing sequence of 24-byte nonces.
//!
//! # Design
//!
//! - Nonces are treated as unsigned 192-bit little-endian integers (the same
//!   convention as libsodium's `sodium_increment`)
//! - `next()` returns the current value and then increments it
//! - Wrapping past `2^192 - 1` is fatal: the sequencer refuses to hand out more
//!   nonces instead of silently restarting at zero
//!
//! # Thread Safety
//!
//! A sequencer belongs to exactly one session and is NOT thread-safe.

use crate::entropy::{random_bytes, EntropySource};
use crate::CryptoError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::cmp::Ordering;

/// Nonce size for XSalsa20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// A 24-byte box nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// Increment a nonce by one (little-endian).
///
/// Returns `None` if the value wrapped around.
pub fn increment(nonce: &Nonce) -> Option<Nonce> {
    let mut out = *nonce;
    for byte in out.iter_mut() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            return Some(out);
        }
    }
    None
}

/// Compare two nonces as little-endian integers.
pub fn compare_le(a: &Nonce, b: &Nonce) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Parse a standard-base64 encoded nonce.
pub fn nonce_from_base64(s: &str) -> Result<Nonce, CryptoError> {
    let bytes = STANDARD
        .decode(s)
        .map_err(|_| CryptoError::InvalidNonce(0))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| CryptoError::InvalidNonce(len))
}

pub fn nonce_to_base64(nonce: &Nonce) -> String {
    STANDARD.encode(nonce)
}

/// Strictly increasing nonce source for one session.
#[derive(Debug, Clone)]
pub struct NonceSequencer {
    current: Nonce,
    exhausted: bool,
    issued: u64,
}

impl NonceSequencer {
    /// Start a sequence at the given value.
    pub fn new(seed: Nonce) -> Self {
        Self {
            current: seed,
            exhausted: false,
            issued: 0,
        }
    }

    /// Start a sequence at a fresh random value.
    pub fn random(entropy: &mut dyn EntropySource) -> Self {
        Self::new(random_bytes::<NONCE_SIZE>(entropy))
    }

    /// Hand out the next nonce.
    ///
    /// # Errors
    /// Returns `CryptoError::NonceExhausted` once the counter has wrapped.
    pub fn next(&mut self) -> Result<Nonce, CryptoError> {
        if self.exhausted {
            return Err(CryptoError::NonceExhausted);
        }

        let out = self.current;
        match increment(&self.current) {
            Some(next) => self.current = next,
            None => self.exhausted = true,
        }
        self.issued += 1;

        Ok(out)
    }

    /// The value the next call to `next()` will return, if any.
    pub fn peek(&self) -> Option<Nonce> {
        (!self.exhausted).then_some(self.current)
    }

    /// Number of nonces handed out so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }
}
