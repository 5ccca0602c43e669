//! NaCl box encryption.
//!
//! Thin adapter over `crypto_box::SalsaBox` (X25519 key agreement +
//! XSalsa20-Poly1305). The shared key is derived from our secret and the peer's
//! public key on every call and never cached.
//!
//! # Wire Format
//!
//! ```text
//! [16 bytes: Poly1305 tag] [ciphertext]
//! ```
//!
//! The nonce travels separately in the envelope.

use crate::entropy::{random_bytes, EntropySource};
use crate::keys::{KeyPair, PublicKey};
use crate::nonce::{Nonce, NONCE_SIZE};
use crate::CryptoError;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;

/// Poly1305 tag length prepended to every ciphertext.
pub const TAG_SIZE: usize = 16;

fn salsa_box(peer: &PublicKey, own: &KeyPair) -> SalsaBox {
    SalsaBox::new(&peer.to_box_key(), own.box_secret())
}

/// Encrypt `plaintext` for `recipient` with our key pair.
pub fn encrypt(
    plaintext: &[u8],
    nonce: &Nonce,
    recipient: &PublicKey,
    own: &KeyPair,
) -> Result<Vec<u8>, CryptoError> {
    let nonce = crypto_box::Nonce::from(*nonce);
    salsa_box(recipient, own)
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and authenticate `ciphertext` from `sender`.
///
/// # Errors
/// Returns `CryptoError::Authentication` if the tag does not verify (wrong key,
/// wrong nonce, or tampered data). No partial plaintext is ever returned.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &Nonce,
    sender: &PublicKey,
    own: &KeyPair,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::Authentication);
    }

    let nonce = crypto_box::Nonce::from(*nonce);
    salsa_box(sender, own)
        .decrypt(&nonce, ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// A fresh random nonce.
pub fn random_nonce(entropy: &mut dyn EntropySource) -> Nonce {
    random_bytes::<NONCE_SIZE>(entropy)
}
