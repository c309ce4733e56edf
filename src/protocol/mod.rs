//! PhazeVPN wire protocol
//!
//! - Packet header codec
//! - Handshake payload format
//! - Transport encryption of DATA and HANDSHAKE_COMPLETE payloads

pub mod handshake;
pub mod packet;
pub mod transport;

pub use handshake::HandshakePayload;
pub use packet::{decode, encode, Packet, PacketType, MAX_PACKET_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
pub use transport::{TrafficStats, TransportState};
