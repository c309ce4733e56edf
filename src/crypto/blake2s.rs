//! BLAKE2s primitives and session key derivation
//!
//! The KDF is the HKDF construction over HMAC-BLAKE2s: extract with the
//! chaining key, then expand into two 32-byte outputs.

use blake2::{
    digest::{FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Digest,
};
use hmac::SimpleHmac;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Domain separation label mixed into every session's chaining key
pub const SESSION_LABEL: &[u8] = b"phazevpn-session v1";

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 hash of several inputs, concatenated in order
pub fn hash_parts(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// HMAC-BLAKE2s of `data` under `key`
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDF2: two-output key derivation
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = Zeroizing::new(hmac(key, input));

    // T1 = HMAC(temp, 0x01)
    let t1 = hmac(temp.as_ref(), &[0x01]);

    // T2 = HMAC(temp, T1 || 0x02)
    let mut t2_input = Zeroizing::new([0u8; HASH_LEN + 1]);
    t2_input[..HASH_LEN].copy_from_slice(&t1);
    t2_input[HASH_LEN] = 0x02;
    let t2 = hmac(temp.as_ref(), t2_input.as_ref());

    (t1, t2)
}

/// Symmetric material negotiated for one session.
///
/// `key` drives the AEAD, `salt` prefixes every nonce built for it.
/// Both are wiped when the value drops.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub key: [u8; HASH_LEN],
    pub salt: [u8; HASH_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Derive the session key and nonce salt from an ECDH shared secret.
///
/// Both peers call this with the same (client, server) public key order, so
/// the chaining key and therefore the outputs agree.
pub fn derive_session_keys(
    shared_secret: &[u8; HASH_LEN],
    client_public: &[u8; HASH_LEN],
    server_public: &[u8; HASH_LEN],
) -> SessionKeys {
    let chaining = Zeroizing::new(hash_parts(&[SESSION_LABEL, client_public, server_public]));
    let (key, salt) = kdf2(&chaining, shared_secret);
    SessionKeys { key, salt }
}
