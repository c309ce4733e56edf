//! Configuration parsing for PhazeVPN
//!
//! This module handles parsing of INI-style `.conf` files for both the
//! server and client roles.

mod parser;

pub use parser::{ClientConfig, InterfaceConfig, ServerConfig, TunnelConfig, UserConfig, DEFAULT_LISTEN_PORT};
