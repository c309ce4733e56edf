//! PhazeVPN configuration file parser
//!
//! INI-style files with `[Interface]`, `[Server]`, `[Client]` and repeatable
//! `[User]` sections. Keys are case-insensitive; durations are in seconds.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use zeroize::Zeroizing;

use crate::crypto::password::{hash_password, PASSWORD_HASH_LEN};
use crate::error::ConfigError;

/// Default UDP listen port for servers
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Complete PhazeVPN configuration
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    /// Local tunnel interface settings
    pub interface: InterfaceConfig,
    /// Server role settings, if this host serves
    pub server: Option<ServerConfig>,
    /// Client role settings, if this host connects
    pub client: Option<ClientConfig>,
    /// Accounts accepted by the server's legacy password check
    pub users: Vec<UserConfig>,
}

/// Interface (local device) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Requested device name; the OS picks one when unset
    pub name: Option<String>,
    /// Device MTU
    pub mtu: u16,
    /// Keep relaying without a device when one cannot be created
    pub allow_relay_only: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: None,
            mtu: 1400,
            allow_relay_only: true,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP address to bind
    pub listen_address: SocketAddr,
    /// Tunnel network clients are addressed from
    pub network: Ipv4Net,
    /// Idle time after which a session is reaped
    pub session_timeout: Duration,
    /// How often the reaper runs
    pub reaper_interval: Duration,
    /// Cap on concurrently processed datagrams
    pub max_in_flight: usize,
    /// Reject handshakes that carry no credentials
    pub require_auth: bool,
    /// Handshake attempts allowed per source IP per minute
    pub max_handshakes_per_minute: u32,
    /// Live sessions allowed per source IP
    pub max_sessions_per_address: usize,
    /// Requested socket send/receive buffer size in bytes
    pub socket_buffer: usize,
    /// Longest wait for in-flight packets when shutting down
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            // 10.9.0.0/24; the server takes the first host address
            network: Ipv4Net::new(Ipv4Addr::new(10, 9, 0, 0), 24).expect("constant prefix is valid"),
            session_timeout: Duration::from_secs(120),
            reaper_interval: Duration::from_secs(30),
            max_in_flight: 256,
            require_auth: false,
            max_handshakes_per_minute: 5,
            max_sessions_per_address: 3,
            socket_buffer: 4 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host and port (`vpn.example.com:51820` or `203.0.113.7:51820`)
    pub endpoint: String,
    /// Optional legacy username
    pub username: Option<String>,
    /// Password digest presented with the username
    pub password_hash: Option<[u8; PASSWORD_HASH_LEN]>,
    /// How long to wait for the server's handshake response
    pub handshake_timeout: Duration,
    /// Interval between keepalives while established
    pub keepalive_interval: Duration,
}

impl ClientConfig {
    /// Client settings for `endpoint` with everything else defaulted
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: None,
            password_hash: None,
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.prefix_len() > 30 {
            return Err(ConfigError::InvalidCidr {
                value: self.network.to_string(),
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MaxInFlight".to_string(),
                value: "0".to_string(),
            });
        }
        non_zero(self.session_timeout, "SessionTimeout")?;
        non_zero(self.reaper_interval, "ReaperInterval")
    }
}

impl ClientConfig {
    /// Reject values the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.handshake_timeout, "HandshakeTimeout")?;
        non_zero(self.keepalive_interval, "KeepaliveInterval")
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password_hash", &self.password_hash.map(|_| "<redacted>"))
            .field("handshake_timeout", &self.handshake_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

/// A server-side account
#[derive(Clone)]
pub struct UserConfig {
    pub name: String,
    pub password_hash: [u8; PASSWORD_HASH_LEN],
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TunnelConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = TunnelConfig::default();
        let mut current_section: Option<Section> = None;

        let mut client: Option<ClientBuilder> = None;
        let mut current_user: Option<UserBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                if let Some(user) = current_user.take() {
                    config.users.push(user.build()?);
                }

                current_section = Some(match line.to_ascii_lowercase().as_str() {
                    "[interface]" => Section::Interface,
                    "[server]" => {
                        config.server.get_or_insert_with(ServerConfig::default);
                        Section::Server
                    }
                    "[client]" => {
                        client.get_or_insert_with(ClientBuilder::default);
                        Section::Client
                    }
                    "[user]" => {
                        current_user = Some(UserBuilder::default());
                        Section::User
                    }
                    _ => {
                        return Err(ConfigError::ParseError {
                            line: line_num,
                            message: format!("Unknown section: {}", line),
                        })
                    }
                });
                continue;
            }

            // Parse key = value pairs
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = &mut config.interface;
                    match key.as_str() {
                        "name" => iface.name = Some(value.to_string()),
                        "mtu" => iface.mtu = parse_number(value, "Mtu", line_num)?,
                        "allowrelayonly" => {
                            iface.allow_relay_only = parse_bool(value, "AllowRelayOnly", line_num)?
                        }
                        _ => tracing::debug!("Unknown interface key: {}", key),
                    }
                }
                Some(Section::Server) => {
                    let server = config.server.get_or_insert_with(ServerConfig::default);
                    match key.as_str() {
                        "listenaddress" => {
                            server.listen_address =
                                value.parse().map_err(|_| ConfigError::InvalidAddress {
                                    value: value.to_string(),
                                })?;
                        }
                        "listenport" => {
                            let port: u16 = parse_number(value, "ListenPort", line_num)?;
                            server.listen_address.set_port(port);
                        }
                        "network" => {
                            server.network = value.parse().map_err(|_| ConfigError::InvalidCidr {
                                value: value.to_string(),
                            })?;
                        }
                        "sessiontimeout" => {
                            server.session_timeout = parse_seconds(value, "SessionTimeout", line_num)?
                        }
                        "reaperinterval" => {
                            server.reaper_interval = parse_seconds(value, "ReaperInterval", line_num)?
                        }
                        "shutdowntimeout" => {
                            server.shutdown_timeout = parse_seconds(value, "ShutdownTimeout", line_num)?
                        }
                        "maxinflight" => {
                            server.max_in_flight = parse_number(value, "MaxInFlight", line_num)?
                        }
                        "requireauth" => {
                            server.require_auth = parse_bool(value, "RequireAuth", line_num)?
                        }
                        "maxhandshakesperminute" => {
                            server.max_handshakes_per_minute =
                                parse_number(value, "MaxHandshakesPerMinute", line_num)?
                        }
                        "maxsessionsperaddress" => {
                            server.max_sessions_per_address =
                                parse_number(value, "MaxSessionsPerAddress", line_num)?
                        }
                        "socketbuffer" => {
                            server.socket_buffer = parse_number(value, "SocketBuffer", line_num)?
                        }
                        _ => tracing::debug!("Unknown server key: {}", key),
                    }
                }
                Some(Section::Client) => {
                    let builder = client.get_or_insert_with(ClientBuilder::default);
                    match key.as_str() {
                        "endpoint" => builder.endpoint = Some(parse_endpoint(value)?),
                        "username" => builder.username = Some(value.to_string()),
                        "password" => builder.password = Some(Zeroizing::new(value.to_string())),
                        "passwordhash" => {
                            builder.password_hash = Some(parse_hash(value, "client")?);
                        }
                        "handshaketimeout" => {
                            builder.handshake_timeout =
                                Some(parse_seconds(value, "HandshakeTimeout", line_num)?)
                        }
                        "keepaliveinterval" => {
                            builder.keepalive_interval =
                                Some(parse_seconds(value, "KeepaliveInterval", line_num)?)
                        }
                        _ => tracing::debug!("Unknown client key: {}", key),
                    }
                }
                Some(Section::User) => {
                    let user = current_user.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "User value outside of [User] section".to_string(),
                    })?;
                    match key.as_str() {
                        "name" => user.name = Some(value.to_string()),
                        "passwordhash" => user.password_hash = Some(value.to_string()),
                        _ => tracing::debug!("Unknown user key: {}", key),
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(user) = current_user.take() {
            config.users.push(user.build()?);
        }
        if let Some(builder) = client {
            config.client = Some(builder.build()?);
        }
        if let Some(server) = &config.server {
            server.validate()?;
        }

        Ok(config)
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Server,
    Client,
    User,
}

/// Builder for ClientConfig during parsing
#[derive(Default)]
struct ClientBuilder {
    endpoint: Option<String>,
    username: Option<String>,
    password: Option<Zeroizing<String>>,
    password_hash: Option<[u8; PASSWORD_HASH_LEN]>,
    handshake_timeout: Option<Duration>,
    keepalive_interval: Option<Duration>,
}

impl ClientBuilder {
    fn build(self) -> Result<ClientConfig, ConfigError> {
        let endpoint = self.endpoint.ok_or(ConfigError::MissingField {
            field: "Endpoint in [Client]".to_string(),
        })?;

        let password_hash = match (self.password_hash, &self.password, &self.username) {
            (Some(hash), _, _) => Some(hash),
            (None, Some(password), Some(username)) => Some(
                hash_password(username, password).map_err(|e| ConfigError::InvalidValue {
                    field: "Password".to_string(),
                    value: e.to_string(),
                })?,
            ),
            (None, Some(_), None) => {
                return Err(ConfigError::MissingField {
                    field: "Username in [Client]".to_string(),
                })
            }
            (None, None, _) => None,
        };

        let mut client = ClientConfig::new(endpoint);
        client.username = self.username;
        client.password_hash = password_hash;
        if let Some(timeout) = self.handshake_timeout {
            client.handshake_timeout = timeout;
        }
        if let Some(interval) = self.keepalive_interval {
            client.keepalive_interval = interval;
        }
        client.validate()?;
        Ok(client)
    }
}

/// Builder for UserConfig during parsing
#[derive(Default)]
struct UserBuilder {
    name: Option<String>,
    password_hash: Option<String>,
}

impl UserBuilder {
    fn build(self) -> Result<UserConfig, ConfigError> {
        let name = self.name.ok_or(ConfigError::MissingField {
            field: "Name in [User]".to_string(),
        })?;
        let hash = self.password_hash.ok_or(ConfigError::MissingField {
            field: format!("PasswordHash for user {}", name),
        })?;
        let password_hash = parse_hash(&hash, &name)?;
        Ok(UserConfig {
            name,
            password_hash,
        })
    }
}

fn non_zero(value: Duration, field: &str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(())
}

/// Parse a hex-encoded 32-byte password digest
fn parse_hash(value: &str, user: &str) -> Result<[u8; PASSWORD_HASH_LEN], ConfigError> {
    let bytes = hex::decode(value).map_err(|_| ConfigError::InvalidPasswordHash {
        user: user.to_string(),
    })?;

    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidPasswordHash {
            user: user.to_string(),
        })
}

/// Parse an endpoint (host:port). Hostnames are resolved at connect time.
fn parse_endpoint(value: &str) -> Result<String, ConfigError> {
    if value.parse::<SocketAddr>().is_ok() {
        return Ok(value.to_string());
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(value.to_string()),
        _ => Err(ConfigError::InvalidAddress {
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str, line: usize) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

fn parse_seconds(value: &str, field: &str, line: usize) -> Result<Duration, ConfigError> {
    parse_number::<u64>(value, field, line).map(Duration::from_secs)
}

fn parse_bool(value: &str, field: &str, line: usize) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::ParseError {
            line,
            message: format!("Invalid {}: {}", field, value),
        }),
    }
}
