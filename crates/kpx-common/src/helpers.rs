//! Common helper functions for kpx.

use kpx_crypto::PublicKey;
use sha2::{Digest, Sha256};

/// Performs a constant-time comparison of two byte strings.
/// Used when comparing key material and database hashes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Short, log-safe fingerprint of a public key.
pub fn key_fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Truncate an identifier (database hash, client id) for logging.
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(8).collect();
    if prefix.len() < value.len() {
        format!("{}…", prefix)
    } else {
        prefix
    }
}
