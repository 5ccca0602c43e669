//! Curve25519 key pairs.
//!
//! Two kinds of key pair exist in the protocol:
//! - the **session key pair**, generated per connection and thrown away on disconnect
//! - the **identification key pair**, generated once per database association and
//!   persisted so the client can prove its identity again after reconnecting
//!
//! Both are plain Curve25519 box keys; the difference is only their lifetime.
//!
//! # Example
//!
//! ```
//! use kpx_crypto::{entropy::os_entropy, KeyPair};
//!
//! let mut entropy = os_entropy();
//! let keypair = KeyPair::generate(entropy.as_mut());
//!
//! // The public half travels as standard base64.
//! let encoded = keypair.public().to_base64();
//! assert_eq!(encoded.len(), 44);
//! ```

use crate::entropy::{random_bytes, EntropySource};
use crate::{CryptoError, KEY_SIZE};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use zeroize::Zeroizing;

/// Curve25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a byte slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse a standard-base64 encoded key.
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_box_key(self) -> crypto_box::PublicKey {
        crypto_box::PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Curve25519 key pair.
///
/// The secret half is zeroized on drop by `crypto_box`.
#[derive(Clone)]
pub struct KeyPair {
    secret: crypto_box::SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair from the given entropy source.
    pub fn generate(entropy: &mut dyn EntropySource) -> Self {
        let bytes = Zeroizing::new(random_bytes::<KEY_SIZE>(entropy));
        Self::from_secret_bytes(*bytes)
    }

    /// Rebuild a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = crypto_box::SecretKey::from(bytes);
        let public = PublicKey(*secret.public_key().as_bytes());
        Self { secret, public }
    }

    /// Rebuild a key pair from a standard-base64 encoded secret.
    pub fn from_secret_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(s)
                .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {}", e)))?,
        );
        let arr: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "invalid secret key length: expected {} bytes",
                KEY_SIZE
            ))
        })?;
        Ok(Self::from_secret_bytes(arr))
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Secret key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes recreate the identity. The returned
    /// buffer is wiped when dropped.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Secret key as standard base64, for persistence.
    pub fn secret_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.secret_bytes().as_slice()))
    }

    pub(crate) fn box_secret(&self) -> &crypto_box::SecretKey {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for KeyPair {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_keypair_generation() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = KeyPair::generate(&mut rng);
        let b = KeyPair::generate(&mut rng);

        assert_ne!(a.public(), b.public());
        assert_eq!(a.public().to_base64().len(), 44);
    }

    #[test]
    fn test_keypair_secret_roundtrip() {
        let mut rng = StdRng::seed_from_u64(2);
        let keypair = KeyPair::generate(&mut rng);

        let restored = KeyPair::from_secret_base64(&keypair.secret_base64()).unwrap();
        assert_eq!(restored.public(), keypair.public());
    }

    #[test]
    fn test_public_key_base64() {
        let mut rng = StdRng::seed_from_u64(3);
        let keypair = KeyPair::generate(&mut rng);

        let parsed = PublicKey::from_base64(&keypair.public().to_base64()).unwrap();
        assert_eq!(&parsed, keypair.public());
    }

    #[test]
    fn test_public_key_wrong_length() {
        let short = STANDARD.encode([0u8; 31]);
        assert!(matches!(
            PublicKey::from_base64(&short),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(PublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let mut rng = StdRng::seed_from_u64(4);
        let keypair = KeyPair::generate(&mut rng);
        let secret = keypair.secret_base64();

        let debug = format!("{:?}", keypair);
        assert!(!debug.contains(secret.as_str()));
    }
}
