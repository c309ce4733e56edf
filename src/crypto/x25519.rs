//! X25519 Diffie-Hellman key exchange
//!
//! Every handshake uses a fresh key pair on both sides; nothing long-term
//! is kept.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Ephemeral X25519 key pair. The secret half is zeroized on drop.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, as sent on the wire
    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    /// Compute the shared secret with a peer's public key.
    ///
    /// Low-order peer points produce an all-zero secret and are rejected.
    pub fn diffie_hellman(&self, peer_public: &[u8; KEY_LEN]) -> Result<SharedSecret, CryptoError> {
        if !is_valid_public_key(peer_public) {
            return Err(CryptoError::InvalidPublicKey);
        }

        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(shared)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Reject the all-zero key outright; other low-order points are caught by
/// the contributory check after DH.
pub fn is_valid_public_key(key: &[u8; KEY_LEN]) -> bool {
    !key.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keypair_generation() {
        let pair = KeyPair::generate();
        assert!(!pair.public_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dh_shared_secret() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let shared_alice = alice.diffie_hellman(&bob.public_bytes()).unwrap();
        let shared_bob = bob.diffie_hellman(&alice.public_bytes()).unwrap();

        assert_eq!(shared_alice.as_bytes(), shared_bob.as_bytes());
    }

    #[test]
    fn test_dh_different_peers() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();

        let shared_bob = alice.diffie_hellman(&bob.public_bytes()).unwrap();
        let shared_carol = alice.diffie_hellman(&carol.public_bytes()).unwrap();

        assert_ne!(shared_bob.as_bytes(), shared_carol.as_bytes());
    }

    #[test]
    fn test_shared_secrets_distinct_over_many_trials() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let a = KeyPair::generate();
            let b = KeyPair::generate();
            let shared = a.diffie_hellman(&b.public_bytes()).unwrap();
            assert!(seen.insert(*shared.as_bytes()), "shared secret repeated");
        }
    }

    #[test]
    fn test_rejects_zero_and_low_order_keys() {
        let pair = KeyPair::generate();
        assert_eq!(
            pair.diffie_hellman(&[0u8; 32]).err().unwrap(),
            CryptoError::InvalidPublicKey
        );

        // u = 1 is a point of small order on Curve25519
        let mut low_order = [0u8; 32];
        low_order[0] = 1;
        assert_eq!(
            pair.diffie_hellman(&low_order).err().unwrap(),
            CryptoError::InvalidPublicKey
        );
    }
}
