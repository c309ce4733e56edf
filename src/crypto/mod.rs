//! Cryptographic primitives for the PhazeVPN tunnel
//!
//! - BLAKE2s hashing, HMAC and session key derivation (blake2s)
//! - XChaCha20-Poly1305 AEAD sealing of tunneled packets (aead)
//! - X25519 ephemeral key exchange (x25519)
//! - Legacy username/password hashing (password)

pub mod aead;
pub mod blake2s;
pub mod password;
pub mod x25519;

pub use blake2s::{derive_session_keys, SessionKeys};
pub use x25519::KeyPair;
