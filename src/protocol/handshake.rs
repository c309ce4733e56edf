//! Handshake payload format
//!
//! Carried by HANDSHAKE_INIT (client public key and optional credentials)
//! and HANDSHAKE_RESPONSE (server public key and the assigned tunnel
//! address):
//!
//! ```text
//! public_key(32) | username_len(1) | username(N) | hash_present(1) | password_hash(32)?
//! [ address_present(1) | ipv4(4) | prefix_len(1) ]?
//! ```

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use zeroize::Zeroize;

use crate::crypto::password::PASSWORD_HASH_LEN;
use crate::crypto::x25519::KEY_LEN;
use crate::error::ProtocolError;

/// Longest username that fits the one-byte length prefix
pub const MAX_USERNAME_LEN: usize = u8::MAX as usize;

/// Decoded handshake payload
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub public_key: [u8; KEY_LEN],
    pub username: Option<String>,
    pub password_hash: Option<[u8; PASSWORD_HASH_LEN]>,
    pub assigned_address: Option<Ipv4Net>,
}

impl HandshakePayload {
    /// Payload carrying only a public key
    pub fn new(public_key: [u8; KEY_LEN]) -> Self {
        Self {
            public_key,
            username: None,
            password_hash: None,
            assigned_address: None,
        }
    }

    /// Attach legacy credentials
    pub fn with_credentials(mut self, username: String, password_hash: Option<[u8; PASSWORD_HASH_LEN]>) -> Self {
        self.username = Some(username);
        self.password_hash = password_hash;
        self
    }

    /// Attach the tunnel address assigned by the server
    pub fn with_address(mut self, address: Ipv4Net) -> Self {
        self.assigned_address = Some(address);
        self
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let username = self.username.as_deref().unwrap_or("");
        if username.len() > MAX_USERNAME_LEN {
            return Err(ProtocolError::MalformedPacket("username too long"));
        }

        let mut buf = Vec::with_capacity(KEY_LEN + 2 + username.len() + PASSWORD_HASH_LEN + 6);
        buf.extend_from_slice(&self.public_key);
        buf.push(username.len() as u8);
        buf.extend_from_slice(username.as_bytes());

        match &self.password_hash {
            Some(hash) => {
                buf.push(1);
                buf.extend_from_slice(hash);
            }
            None => buf.push(0),
        }

        if let Some(net) = &self.assigned_address {
            buf.push(1);
            buf.extend_from_slice(&net.addr().octets());
            buf.push(net.prefix_len());
        }

        Ok(buf)
    }

    /// Parse wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader { data, pos: 0 };

        let mut public_key = [0u8; KEY_LEN];
        public_key.copy_from_slice(reader.take(KEY_LEN, "truncated public key")?);

        let username_len = reader.byte("missing username length")? as usize;
        let username_bytes = reader.take(username_len, "username overruns payload")?;
        let username = if username_len == 0 {
            None
        } else {
            let name = std::str::from_utf8(username_bytes)
                .map_err(|_| ProtocolError::MalformedPacket("username is not UTF-8"))?;
            Some(name.to_string())
        };

        let password_hash = if reader.flag("missing password flag")? {
            let mut hash = [0u8; PASSWORD_HASH_LEN];
            hash.copy_from_slice(reader.take(PASSWORD_HASH_LEN, "truncated password hash")?);
            Some(hash)
        } else {
            None
        };

        // The address block is omitted rather than flagged absent
        let assigned_address = if reader.remaining() == 0 {
            None
        } else {
            if reader.byte("missing address flag")? != 1 {
                return Err(ProtocolError::MalformedPacket("invalid address flag"));
            }
            let octets = reader.take(4, "truncated address")?;
            let addr = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            let prefix = reader.byte("missing prefix length")?;
            let net = Ipv4Net::new(addr, prefix)
                .map_err(|_| ProtocolError::MalformedPacket("prefix length out of range"))?;
            Some(net)
        };

        if reader.remaining() != 0 {
            return Err(ProtocolError::MalformedPacket("trailing bytes in handshake payload"));
        }

        Ok(Self {
            public_key,
            username,
            password_hash,
            assigned_address,
        })
    }
}

impl Drop for HandshakePayload {
    fn drop(&mut self) {
        self.public_key.zeroize();
        self.password_hash.zeroize();
    }
}

impl std::fmt::Debug for HandshakePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakePayload")
            .field("public_key", &hex::encode(&self.public_key[..8]))
            .field("username", &self.username)
            .field("password_hash", &self.password_hash.map(|_| "<redacted>"))
            .field("assigned_address", &self.assigned_address)
            .finish()
    }
}

/// Bounds-checked cursor over a payload
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::MalformedPacket(what));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn byte(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn flag(&mut self, what: &'static str) -> Result<bool, ProtocolError> {
        match self.byte(what)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProtocolError::MalformedPacket("invalid presence flag")),
        }
    }
}
