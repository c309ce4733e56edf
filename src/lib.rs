//! PhazeVPN - point-to-point UDP tunnel
//!
//! A client and server that relay raw IP packets over UDP after an
//! ephemeral X25519 handshake, with every packet sealed by
//! XChaCha20-Poly1305.
//!
//! # Features
//!
//! - Compact 12-byte packet header with session ids and sequence numbers
//! - Key confirmation before a session carries data
//! - Per-client tunnel address allocation from a configurable network
//! - Optional username/password check at handshake time
//! - Idle session reaping, keepalives and client roaming
//! - Relay-only operation when no TUN device can be created
//!
//! # Usage
//!
//! ```no_run
//! use phazevpn::{TunnelClient, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), phazevpn::VpnError> {
//!     let config = TunnelConfig::from_file("phazevpn.conf")?;
//!     let client = TunnelClient::connect(&config).await?;
//!     client.run().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tunnel;

pub use client::{handshake, EstablishedSession, TunnelClient};
pub use config::TunnelConfig;
pub use error::VpnError;
pub use server::TunnelServer;
