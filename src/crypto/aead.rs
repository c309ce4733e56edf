//! AEAD sealing for tunnel traffic
//!
//! XChaCha20-Poly1305 with a 24-byte nonce assembled from the session's
//! nonce salt and a 16-byte per-packet nonce carried on the wire.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// Per-packet nonce length as carried in DATA payloads
pub const WIRE_NONCE_LEN: usize = 16;

/// Bytes of the session salt prefixed to the wire nonce
const SALT_PREFIX_LEN: usize = XNONCE_LEN - WIRE_NONCE_LEN;

/// Which peer sealed a packet. Stamped into the first nonce byte so the two
/// directions of a session can never produce the same nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    ClientToServer = 0x01,
    ServerToClient = 0x02,
}

impl Direction {
    /// The direction traffic flows back in
    pub fn reverse(self) -> Self {
        match self {
            Self::ClientToServer => Self::ServerToClient,
            Self::ServerToClient => Self::ClientToServer,
        }
    }
}

/// Build a wire nonce: `[direction:1][counter:8 BE][random:7]`
pub fn wire_nonce(direction: Direction, counter: u64) -> [u8; WIRE_NONCE_LEN] {
    let mut nonce = [0u8; WIRE_NONCE_LEN];
    nonce[0] = direction as u8;
    nonce[1..9].copy_from_slice(&counter.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut nonce[9..]);
    nonce
}

/// Direction byte of a received wire nonce
pub fn wire_nonce_direction(nonce: &[u8; WIRE_NONCE_LEN]) -> u8 {
    nonce[0]
}

/// Expand a wire nonce into the full XChaCha nonce for this session
pub fn full_nonce(salt: &[u8], wire: &[u8; WIRE_NONCE_LEN]) -> [u8; XNONCE_LEN] {
    let mut nonce = [0u8; XNONCE_LEN];
    nonce[..SALT_PREFIX_LEN].copy_from_slice(&salt[..SALT_PREFIX_LEN]);
    nonce[SALT_PREFIX_LEN..].copy_from_slice(wire);
    nonce
}

/// Encrypt and authenticate `plaintext`, binding `aad`
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(
            xnonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Verify and decrypt `ciphertext`. Any tampering, wrong key or wrong
/// `aad` yields `AuthenticationFailed` and no plaintext.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(
            xnonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
