//! Entropy capability.
//!
//! Key generation, nonce seeding and client ids all draw from an
//! [`EntropySource`] that is passed in explicitly. Production code uses
//! [`OsEntropy`]; tests plug in a seeded `StdRng`.

use rand::{CryptoRng, RngCore};

/// Source of cryptographically secure random bytes.
pub trait EntropySource: Send {
    fn fill(&mut self, dest: &mut [u8]);
}

impl<R: RngCore + CryptoRng + Send> EntropySource for R {
    fn fill(&mut self, dest: &mut [u8]) {
        self.fill_bytes(dest);
    }
}

/// The host CSPRNG.
pub type OsEntropy = rand::rngs::OsRng;

/// Boxed OS entropy, the default for new sessions.
pub fn os_entropy() -> Box<dyn EntropySource> {
    Box::new(rand::rngs::OsRng)
}

/// Draw `N` random bytes.
pub fn random_bytes<const N: usize>(entropy: &mut dyn EntropySource) -> [u8; N] {
    let mut out = [0u8; N];
    entropy.fill(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_seeded_source_is_deterministic() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);

        let x: [u8; 24] = random_bytes(&mut a);
        let y: [u8; 24] = random_bytes(&mut b);
        assert_eq!(x, y);
    }

    #[test]
    fn test_os_entropy_fills() {
        let mut os = os_entropy();
        let x: [u8; 32] = random_bytes(os.as_mut());
        let y: [u8; 32] = random_bytes(os.as_mut());
        assert_ne!(x, y);
    }
}
