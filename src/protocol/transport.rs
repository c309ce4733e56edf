//! Transport layer encryption
//!
//! A `TransportState` owns one session's keys and counters. It is shared
//! behind an `Arc` so packets can be sealed and opened without holding the
//! session table lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::crypto::aead::{self, Direction, TAG_LEN, WIRE_NONCE_LEN};
use crate::crypto::SessionKeys;
use crate::error::{CryptoError, VpnError};
use crate::protocol::packet::{Packet, PacketType};

/// Smallest sealed payload: wire nonce plus tag
pub const MIN_SEALED_LEN: usize = WIRE_NONCE_LEN + TAG_LEN;

/// Additional authenticated data binding a ciphertext to its packet type
/// and session
pub fn associated_data(packet_type: PacketType, session_id: u32) -> [u8; 5] {
    let id = session_id.to_be_bytes();
    [packet_type as u8, id[0], id[1], id[2], id[3]]
}

/// Snapshot of a session's traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
}

/// Transport state for a session
pub struct TransportState {
    /// Negotiated key and nonce salt
    keys: SessionKeys,
    /// Direction stamped on packets we seal
    direction: Direction,
    /// Nonce counter for outgoing packets; never reused
    send_counter: AtomicU64,
    /// Header sequence number for outgoing packets (diagnostic only)
    sequence: AtomicU32,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
}

impl TransportState {
    /// Create a transport state that seals in `direction`
    pub fn new(keys: SessionKeys, direction: Direction) -> Self {
        Self {
            keys,
            direction,
            send_counter: AtomicU64::new(0),
            sequence: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    /// Client side of a session
    pub fn client(keys: SessionKeys) -> Self {
        Self::new(keys, Direction::ClientToServer)
    }

    /// Server side of a session
    pub fn server(keys: SessionKeys) -> Self {
        Self::new(keys, Direction::ServerToClient)
    }

    /// Next header sequence number
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn next_counter(&self) -> Result<u64, CryptoError> {
        self.send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1))
            .map_err(|_| CryptoError::NonceExhausted)
    }

    /// Seal `plaintext` into `[wire_nonce][ciphertext+tag]`
    pub fn seal(&self, packet_type: PacketType, session_id: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.next_counter()?;
        let wire = aead::wire_nonce(self.direction, counter);
        let nonce = aead::full_nonce(&self.keys.salt, &wire);
        let aad = associated_data(packet_type, session_id);

        let ciphertext = aead::seal(&self.keys.key, &nonce, plaintext, &aad)?;

        let mut payload = Vec::with_capacity(WIRE_NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&wire);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Open a payload sealed by the peer. Packets stamped with our own
    /// direction are rejected like any other forgery.
    pub fn open(&self, packet_type: PacketType, session_id: u32, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < MIN_SEALED_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }

        let mut wire = [0u8; WIRE_NONCE_LEN];
        wire.copy_from_slice(&payload[..WIRE_NONCE_LEN]);
        if aead::wire_nonce_direction(&wire) != self.direction.reverse() as u8 {
            return Err(CryptoError::AuthenticationFailed);
        }

        let nonce = aead::full_nonce(&self.keys.salt, &wire);
        let aad = associated_data(packet_type, session_id);
        aead::open(&self.keys.key, &nonce, &payload[WIRE_NONCE_LEN..], &aad)
    }

    /// Encrypt a tunneled IP packet into a DATA packet
    pub fn seal_data(&self, session_id: u32, ip_packet: &[u8]) -> Result<Packet, VpnError> {
        let payload = self.seal(PacketType::Data, session_id, ip_packet)?;
        self.bytes_sent.fetch_add(ip_packet.len() as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(Packet::new(PacketType::Data, session_id, self.next_sequence(), payload))
    }

    /// Decrypt a DATA packet back into the tunneled IP packet
    pub fn open_data(&self, packet: &Packet) -> Result<Vec<u8>, CryptoError> {
        let plaintext = self.open(PacketType::Data, packet.session_id, &packet.payload)?;
        self.bytes_received.fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }

    /// HANDSHAKE_COMPLETE carrying a sealed empty message, proving the
    /// sender derived the same keys
    pub fn key_confirmation(&self, session_id: u32) -> Result<Packet, CryptoError> {
        let payload = self.seal(PacketType::HandshakeComplete, session_id, &[])?;
        Ok(Packet::new(
            PacketType::HandshakeComplete,
            session_id,
            self.next_sequence(),
            payload,
        ))
    }

    /// Check a peer's HANDSHAKE_COMPLETE
    pub fn verify_confirmation(&self, packet: &Packet) -> Result<(), CryptoError> {
        let plaintext = self.open(PacketType::HandshakeComplete, packet.session_id, &packet.payload)?;
        if !plaintext.is_empty() {
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(())
    }

    /// Current traffic counters
    pub fn stats(&self) -> TrafficStats {
        TrafficStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn set_counter(&self, value: u64) {
        self.send_counter.store(value, Ordering::Release);
    }
}

impl std::fmt::Debug for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportState")
            .field("direction", &self.direction)
            .field("send_counter", &self.send_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
