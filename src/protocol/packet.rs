//! PhazeVPN packet wire format
//!
//! Every datagram carries a 12-byte big-endian header followed by an
//! opaque payload:
//!
//! ```text
//! version(1) | type(1) | session_id(4) | sequence(4) | payload_len(2) | payload(N)
//! ```

use crate::error::ProtocolError;

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed packet header
pub const HEADER_LEN: usize = 12;

/// Largest payload a packet may carry (16 KiB)
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024;

/// Largest datagram the codec accepts
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// PhazeVPN packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    HandshakeInit = 0x01,
    HandshakeResponse = 0x02,
    HandshakeComplete = 0x03,
    Data = 0x10,
    Keepalive = 0x20,
    Disconnect = 0x30,
    Error = 0x40,
}

impl PacketType {
    /// Short name for logs and errors
    pub fn name(self) -> &'static str {
        match self {
            Self::HandshakeInit => "handshake-init",
            Self::HandshakeResponse => "handshake-response",
            Self::HandshakeComplete => "handshake-complete",
            Self::Data => "data",
            Self::Keepalive => "keepalive",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<PacketType, ProtocolError> {
        match value {
            0x01 => Ok(PacketType::HandshakeInit),
            0x02 => Ok(PacketType::HandshakeResponse),
            0x03 => Ok(PacketType::HandshakeComplete),
            0x10 => Ok(PacketType::Data),
            0x20 => Ok(PacketType::Keepalive),
            0x30 => Ok(PacketType::Disconnect),
            0x40 => Ok(PacketType::Error),
            _ => Err(ProtocolError::MalformedPacket("unknown packet type")),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded packet. The payload is never interpreted by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub session_id: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet for the current protocol version
    pub fn new(packet_type: PacketType, session_id: u32, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            session_id,
            sequence,
            payload,
        }
    }

    /// Payload-free control packet (keepalive, disconnect)
    pub fn control(packet_type: PacketType, session_id: u32, sequence: u32) -> Self {
        Self::new(packet_type, session_id, sequence, Vec::new())
    }

    /// ERROR packet carrying a human-readable reason
    pub fn error(session_id: u32, reason: &str) -> Self {
        let mut payload = reason.as_bytes().to_vec();
        payload.truncate(MAX_PAYLOAD_LEN);
        Self::new(PacketType::Error, session_id, 0, payload)
    }

    /// Reason text of an ERROR packet, lossily decoded
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Serialize a packet to its wire form
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    if packet.payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len: packet.payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + packet.payload.len());
    buf.push(packet.version);
    buf.push(packet.packet_type as u8);
    buf.extend_from_slice(&packet.session_id.to_be_bytes());
    buf.extend_from_slice(&packet.sequence.to_be_bytes());
    buf.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&packet.payload);
    Ok(buf)
}

/// Parse a datagram. The datagram must be exactly one packet long.
pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedPacket("truncated header"));
    }

    let version = data[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::MalformedPacket("unsupported version"));
    }

    let packet_type = PacketType::try_from(data[1])?;
    let session_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    let sequence = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
    let payload_len = u16::from_be_bytes([data[10], data[11]]) as usize;

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::MalformedPacket("declared payload too large"));
    }

    let body = &data[HEADER_LEN..];
    if body.len() < payload_len {
        return Err(ProtocolError::MalformedPacket("truncated payload"));
    }
    if body.len() > payload_len {
        return Err(ProtocolError::MalformedPacket("trailing bytes after payload"));
    }

    Ok(Packet {
        version,
        packet_type,
        session_id,
        sequence,
        payload: body.to_vec(),
    })
}
