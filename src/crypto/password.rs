//! Username/password credentials
//!
//! Clients present an Argon2id digest of their password rather than the
//! password itself. The salt is derived from the username so the digest can
//! be precomputed and stored in the server's user list.

use argon2::Argon2;
use subtle::ConstantTimeEq;

use super::blake2s;
use crate::error::CryptoError;

/// Length of a password digest on the wire and in the user list
pub const PASSWORD_HASH_LEN: usize = 32;

const PASSWORD_SALT_LABEL: &[u8] = b"phazevpn-password";
const PASSWORD_SALT_LEN: usize = 16;

/// Derive the 32-byte credential digest for `username`/`password`
pub fn hash_password(username: &str, password: &str) -> Result<[u8; PASSWORD_HASH_LEN], CryptoError> {
    let salt = blake2s::hash_parts(&[PASSWORD_SALT_LABEL, username.as_bytes()]);

    let mut out = [0u8; PASSWORD_HASH_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), &salt[..PASSWORD_SALT_LEN], &mut out)
        .map_err(|e| CryptoError::PasswordHash {
            reason: e.to_string(),
        })?;
    Ok(out)
}

/// Compare two digests in constant time
pub fn verify_password_hash(expected: &[u8; PASSWORD_HASH_LEN], presented: &[u8; PASSWORD_HASH_LEN]) -> bool {
    expected.ct_eq(presented).into()
}
