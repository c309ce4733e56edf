//! Error types for the PhazeVPN tunnel core

use thiserror::Error;

/// Main error type for PhazeVPN
#[derive(Error, Debug)]
pub enum VpnError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid password hash for user {user}")]
    InvalidPasswordHash { user: String },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed: invalid ciphertext or tag")]
    AuthenticationFailed,

    #[error("Invalid peer public key")]
    InvalidPublicKey,

    #[error("Nonce counter exhausted for this session")]
    NonceExhausted,

    #[error("Password hashing failed: {reason}")]
    PasswordHash { reason: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: u32 },

    #[error("Session {session_id} is not established")]
    SessionNotEstablished { session_id: u32 },

    #[error("Unexpected {packet_type} packet")]
    UnexpectedPacket { packet_type: &'static str },

    #[error("Authentication rejected for {user}")]
    AuthenticationRejected { user: String },

    #[error("Tunnel address pool exhausted")]
    AddressPoolExhausted,

    #[error("Too many handshakes from {address}")]
    RateLimited { address: String },

    #[error("Too many sessions from {address}")]
    SessionLimitReached { address: String },

    #[error("Session terminated by server: {reason}")]
    SessionTerminated { reason: String },
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("DNS resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel interface unavailable: {reason}")]
    InterfaceUnavailable { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Tunnel interface closed")]
    Closed,
}

impl VpnError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Tunnel(TunnelError::InterfaceUnavailable { reason }) => {
                #[cfg(target_os = "linux")]
                return format!(
                    "Could not create the tunnel interface ({}).\n  \
                     Run with sudo or grant CAP_NET_ADMIN:\n  \
                     sudo setcap cap_net_admin=eip ./phazevpn",
                    reason
                );
                #[cfg(not(target_os = "linux"))]
                return format!(
                    "Could not create the tunnel interface ({}).\n  \
                     Run with elevated privileges.",
                    reason
                );
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Protocol(ProtocolError::HandshakeFailed { reason }) => {
                format!(
                    "Could not connect: {}.\n  \
                     Check network connectivity and firewall rules for the server's UDP port.",
                    reason
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Tunnel(TunnelError::InterfaceUnavailable { .. }) => false,

            // Per-packet and per-attempt errors
            Self::Protocol(ProtocolError::MalformedPacket(_)) => true,
            Self::Protocol(ProtocolError::SessionNotFound { .. }) => true,
            Self::Protocol(ProtocolError::SessionNotEstablished { .. }) => true,
            Self::Protocol(ProtocolError::HandshakeFailed { .. }) => true,
            Self::Protocol(ProtocolError::RateLimited { .. }) => true,
            Self::Protocol(ProtocolError::SessionLimitReached { .. }) => true,
            Self::Crypto(CryptoError::AuthenticationFailed) => true,
            Self::Network(_) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::InterfaceUnavailable { .. }) => 2,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for PhazeVPN operations
pub type Result<T> = std::result::Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_packet_errors_are_recoverable() {
        let malformed: VpnError = ProtocolError::MalformedPacket("truncated header").into();
        let auth: VpnError = CryptoError::AuthenticationFailed.into();
        let unknown: VpnError = ProtocolError::SessionNotFound { session_id: 7 }.into();

        assert!(malformed.is_recoverable());
        assert!(auth.is_recoverable());
        assert!(unknown.is_recoverable());
    }

    #[test]
    fn test_exit_codes() {
        let config: VpnError = ConfigError::MissingField {
            field: "Endpoint".to_string(),
        }
        .into();
        let tunnel: VpnError = TunnelError::InterfaceUnavailable {
            reason: "permission denied".to_string(),
        }
        .into();
        let handshake: VpnError = ProtocolError::HandshakeFailed {
            reason: "timeout".to_string(),
        }
        .into();

        assert_eq!(config.exit_code(), 1);
        assert_eq!(tunnel.exit_code(), 2);
        assert_eq!(handshake.exit_code(), 4);
        assert!(!tunnel.is_recoverable());
    }

    #[test]
    fn test_handshake_user_message() {
        let err: VpnError = ProtocolError::HandshakeFailed {
            reason: "no response within 10s".to_string(),
        }
        .into();
        assert!(err.user_message().starts_with("Could not connect"));
    }
}
