//! PhazeVPN client orchestration
//!
//! `handshake` negotiates a session with the server. `TunnelClient` then
//! runs the main event loop that coordinates:
//! - Tunnel reads, sealed and sent to the server
//! - Server datagrams, opened and written to the tunnel
//! - Keepalive timers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

use crate::config::{ClientConfig, TunnelConfig};
use crate::crypto::{derive_session_keys, KeyPair};
use crate::error::{ConfigError, CryptoError, NetworkError, ProtocolError, TunnelError, VpnError};
use crate::protocol::{self, HandshakePayload, Packet, PacketType, TransportState};
use crate::tunnel::{open_tunnel, TunnelIo};

/// Buffer size for packets
const BUFFER_SIZE: usize = 65535;

/// A session that completed the handshake
pub struct EstablishedSession {
    socket: UdpSocket,
    server: SocketAddr,
    session_id: u32,
    transport: Arc<TransportState>,
    assigned_address: Ipv4Net,
}

impl EstablishedSession {
    /// Session id chosen by the server
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Tunnel address (with prefix) the server assigned us
    pub fn assigned_address(&self) -> Ipv4Net {
        self.assigned_address
    }

    /// Resolved server endpoint
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Socket connected to the server
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Session keys and counters
    pub fn transport(&self) -> &Arc<TransportState> {
        &self.transport
    }

    async fn send(&self, packet: &Packet) -> Result<(), VpnError> {
        let bytes = protocol::encode(packet)?;
        self.socket.send(&bytes).await.map_err(|e| NetworkError::SendFailed {
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("server", &self.server)
            .field("session_id", &format_args!("{:08x}", self.session_id))
            .field("assigned_address", &self.assigned_address)
            .finish_non_exhaustive()
    }
}

/// Resolve `host:port`, preferring an IPv4 address
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, NetworkError> {
    let dns_failed = || NetworkError::DnsResolutionFailed {
        host: endpoint.to_string(),
    };

    let addrs: Vec<SocketAddr> = lookup_host(endpoint).await.map_err(|_| dns_failed())?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(dns_failed)
}

/// Perform the handshake described by `config`'s `[Client]` section
pub async fn handshake(config: &TunnelConfig) -> Result<EstablishedSession, VpnError> {
    let client = client_section(config)?;
    client.validate()?;

    // 1. Resolve and connect
    let server = resolve_endpoint(&client.endpoint).await?;
    let bind_addr: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| NetworkError::BindFailed {
        addr: bind_addr.to_string(),
        reason: e.to_string(),
    })?;
    socket.connect(server).await.map_err(NetworkError::Io)?;

    // 2. Send our ephemeral key and optional credentials
    let keypair = KeyPair::generate();
    let client_public = keypair.public_bytes();
    let mut init = HandshakePayload::new(client_public);
    if let Some(username) = &client.username {
        init = init.with_credentials(username.clone(), client.password_hash);
    }

    let init_packet = Packet::new(PacketType::HandshakeInit, 0, 0, init.encode()?);
    let init_bytes = protocol::encode(&init_packet)?;
    socket.send(&init_bytes).await.map_err(|e| NetworkError::SendFailed {
        reason: e.to_string(),
    })?;
    tracing::info!("Handshake initiated with {}", server);

    // 3. Wait for the response
    let reply = tokio::time::timeout(client.handshake_timeout, await_response(&socket))
        .await
        .map_err(|_| ProtocolError::HandshakeFailed {
            reason: format!("no response within {:?}", client.handshake_timeout),
        })??;

    let response = HandshakePayload::decode(&reply.payload)?;
    let assigned_address = response.assigned_address.ok_or_else(|| ProtocolError::HandshakeFailed {
        reason: "response carried no tunnel address".to_string(),
    })?;

    // 4. Derive keys and confirm them
    let shared = keypair.diffie_hellman(&response.public_key)?;
    let keys = derive_session_keys(shared.as_bytes(), &client_public, &response.public_key);
    drop(shared);
    let transport = Arc::new(TransportState::client(keys));

    let session = EstablishedSession {
        socket,
        server,
        session_id: reply.session_id,
        transport,
        assigned_address,
    };

    let complete = session.transport.key_confirmation(session.session_id)?;
    session.send(&complete).await?;

    tracing::info!(
        "Handshake complete! Session {:08x} established, tunnel address {}",
        session.session_id,
        assigned_address
    );
    Ok(session)
}

/// Wait for a HANDSHAKE_RESPONSE or ERROR, ignoring anything else
async fn await_response(socket: &UdpSocket) -> Result<Packet, VpnError> {
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let len = socket.recv(&mut buf).await.map_err(|e| NetworkError::ReceiveFailed {
            reason: e.to_string(),
        })?;

        match protocol::decode(&buf[..len]) {
            Ok(packet) if packet.packet_type == PacketType::HandshakeResponse && packet.session_id != 0 => {
                return Ok(packet);
            }
            Ok(packet) if packet.packet_type == PacketType::Error => {
                return Err(ProtocolError::HandshakeFailed {
                    reason: packet.error_reason(),
                }
                .into());
            }
            Ok(packet) => {
                tracing::trace!("Ignoring {} packet while handshaking", packet.packet_type);
            }
            Err(e) => {
                tracing::trace!("Ignoring undecodable datagram while handshaking: {}", e);
            }
        }
    }
}

fn client_section(config: &TunnelConfig) -> Result<&ClientConfig, VpnError> {
    config.client.as_ref().ok_or_else(|| {
        ConfigError::MissingField {
            field: "[Client] section".to_string(),
        }
        .into()
    })
}

/// PhazeVPN client
pub struct TunnelClient {
    session: EstablishedSession,
    tunnel: Arc<dyn TunnelIo>,
    keepalive_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelClient {
    /// Wrap an established session and the tunnel it relays for
    pub fn new(session: EstablishedSession, tunnel: Arc<dyn TunnelIo>, config: &ClientConfig) -> Result<Self, VpnError> {
        config.validate()?;
        Ok(Self {
            session,
            tunnel,
            keepalive_interval: config.keepalive_interval,
            shutdown_tx: watch::channel(false).0,
        })
    }

    /// Handshake, open the tunnel with the assigned address, and wrap both
    pub async fn connect(config: &TunnelConfig) -> Result<Self, VpnError> {
        let session = handshake(config).await?;
        let tunnel = open_tunnel(&config.interface, session.assigned_address()).await?;
        Self::new(session, tunnel, client_section(config)?)
    }

    /// The negotiated session
    pub fn session(&self) -> &EstablishedSession {
        &self.session
    }

    /// Ask a running client to disconnect
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Relay traffic until stopped, the tunnel closes, or the server ends
    /// the session
    pub async fn run(&self) -> Result<(), VpnError> {
        let result = self.event_loop().await;

        let terminated = matches!(
            result,
            Err(VpnError::Protocol(ProtocolError::SessionTerminated { .. }))
        );
        if !terminated {
            let bye = Packet::control(
                PacketType::Disconnect,
                self.session.session_id,
                self.session.transport.next_sequence(),
            );
            if let Err(e) = self.session.send(&bye).await {
                tracing::debug!("Failed to send disconnect: {}", e);
            }
        }

        if let Err(e) = self.tunnel.close().await {
            tracing::warn!("Failed to close tunnel: {}", e);
        }

        let stats = self.session.transport.stats();
        tracing::info!(
            "Session {:08x} closed (sent {} bytes, received {} bytes)",
            self.session.session_id,
            stats.bytes_sent,
            stats.bytes_received
        );
        result
    }

    /// Main event loop
    async fn event_loop(&self) -> Result<(), VpnError> {
        let mut tun_buf = vec![0u8; BUFFER_SIZE];
        let mut udp_buf = vec![0u8; BUFFER_SIZE];
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let period = self.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);

        tracing::info!("Entering main event loop...");

        loop {
            if *shutdown_rx.borrow_and_update() {
                return Ok(());
            }

            tokio::select! {
                // Read from tunnel -> encrypt -> send via UDP
                result = self.tunnel.read_packet(&mut tun_buf) => {
                    match result {
                        Ok(len) => match self.send_data(&tun_buf[..len]).await {
                            Ok(()) => {}
                            Err(e @ VpnError::Crypto(CryptoError::NonceExhausted)) => return Err(e),
                            Err(e) => tracing::warn!("Error handling tunnel packet: {}", e),
                        },
                        Err(TunnelError::Closed) => {
                            tracing::info!("Tunnel closed");
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::error!("Tunnel read error: {}", e);
                        }
                    }
                }

                // Read from UDP -> process incoming packet
                result = self.session.socket.recv(&mut udp_buf) => {
                    match result {
                        Ok(len) => self.handle_datagram(&udp_buf[..len]).await?,
                        Err(e) => {
                            tracing::warn!("UDP recv error: {}", e);
                        }
                    }
                }

                // Keepalive timer
                _ = keepalive.tick() => {
                    let packet = Packet::control(
                        PacketType::Keepalive,
                        self.session.session_id,
                        self.session.transport.next_sequence(),
                    );
                    if let Err(e) = self.session.send(&packet).await {
                        tracing::warn!("Keepalive error: {}", e);
                    }
                }

                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }

    /// Seal an IP packet from the tunnel and send it
    async fn send_data(&self, ip_packet: &[u8]) -> Result<(), VpnError> {
        let packet = self.session.transport.seal_data(self.session.session_id, ip_packet)?;
        self.session.send(&packet).await
    }

    /// Handle one datagram from the server. Only session-ending packets
    /// produce an error.
    async fn handle_datagram(&self, datagram: &[u8]) -> Result<(), VpnError> {
        let packet = match protocol::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Dropped datagram from server: {}", e);
                return Ok(());
            }
        };

        // Handshake-level errors carry session id 0
        let session_id = self.session.session_id;
        let ours = packet.session_id == session_id
            || (packet.session_id == 0 && packet.packet_type == PacketType::Error);
        if !ours {
            tracing::trace!("Dropped packet for session {:08x}", packet.session_id);
            return Ok(());
        }

        match packet.packet_type {
            PacketType::Data => {
                let plaintext = match self.session.transport.open_data(&packet) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        tracing::debug!("Dropped data packet: {}", e);
                        return Ok(());
                    }
                };

                // Write decrypted IP packet to the tunnel
                if !plaintext.is_empty() {
                    if let Err(e) = self.tunnel.write_packet(&plaintext).await {
                        tracing::warn!("Tunnel write error: {}", e);
                    }
                }
                Ok(())
            }
            PacketType::Keepalive => {
                tracing::trace!("Keepalive from server");
                Ok(())
            }
            PacketType::Error => Err(ProtocolError::SessionTerminated {
                reason: packet.error_reason(),
            }
            .into()),
            PacketType::Disconnect => Err(ProtocolError::SessionTerminated {
                reason: "server closed the session".to_string(),
            }
            .into()),
            other => {
                tracing::trace!("Ignoring {} packet while established", other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_endpoint() {
        let addr = resolve_endpoint("127.0.0.1:51820").await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 51820)));
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_port() {
        assert!(matches!(
            resolve_endpoint("127.0.0.1").await,
            Err(NetworkError::DnsResolutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_requires_client_section() {
        let config = TunnelConfig::default();
        assert!(matches!(
            handshake(&config).await,
            Err(VpnError::Config(ConfigError::MissingField { .. }))
        ));
    }

    async fn session_for_test(session_id: u32) -> EstablishedSession {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = socket.local_addr().unwrap();
        socket.connect(server).await.unwrap();
        let keys = derive_session_keys(&[3u8; 32], &[1u8; 32], &[2u8; 32]);
        EstablishedSession {
            socket,
            server,
            session_id,
            transport: Arc::new(TransportState::client(keys)),
            assigned_address: "10.9.0.2/24".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_zero_keepalive_rejected() {
        let session = session_for_test(7).await;
        let mut config = ClientConfig::new("127.0.0.1:51820");
        config.keepalive_interval = Duration::ZERO;

        let result = TunnelClient::new(session, Arc::new(crate::tunnel::RelayOnly::new()), &config);
        assert!(matches!(
            result,
            Err(VpnError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_zero_handshake_timeout_rejected() {
        let mut client = ClientConfig::new("127.0.0.1:51820");
        client.handshake_timeout = Duration::ZERO;
        let config = TunnelConfig {
            client: Some(client),
            ..Default::default()
        };
        assert!(matches!(
            handshake(&config).await,
            Err(VpnError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_error_only_ends_own_session() {
        let session = session_for_test(7).await;
        let config = ClientConfig::new("127.0.0.1:51820");
        let client = TunnelClient::new(session, Arc::new(crate::tunnel::RelayOnly::new()), &config).unwrap();

        let foreign = protocol::encode(&Packet::error(8, "not for you")).unwrap();
        assert!(client.handle_datagram(&foreign).await.is_ok());

        let foreign_bye = protocol::encode(&Packet::control(PacketType::Disconnect, 8, 0)).unwrap();
        assert!(client.handle_datagram(&foreign_bye).await.is_ok());

        let general = protocol::encode(&Packet::error(0, "server restarting")).unwrap();
        assert!(matches!(
            client.handle_datagram(&general).await,
            Err(VpnError::Protocol(ProtocolError::SessionTerminated { .. }))
        ));

        let own = protocol::encode(&Packet::error(7, "session revoked")).unwrap();
        match client.handle_datagram(&own).await {
            Err(VpnError::Protocol(ProtocolError::SessionTerminated { reason })) => {
                assert_eq!(reason, "session revoked");
            }
            other => panic!("expected termination, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_surfaces_server_error() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let init = protocol::decode(&buf[..len]).unwrap();
            assert_eq!(init.packet_type, PacketType::HandshakeInit);

            let reply = protocol::encode(&Packet::error(0, "authentication failed")).unwrap();
            server.send_to(&reply, from).await.unwrap();
        });

        let config = TunnelConfig {
            client: Some(ClientConfig::new(endpoint.to_string())),
            ..Default::default()
        };

        match handshake(&config).await {
            Err(VpnError::Protocol(ProtocolError::HandshakeFailed { reason })) => {
                assert_eq!(reason, "authentication failed");
            }
            other => panic!("expected handshake failure, got {:?}", other.map(|s| s.session_id())),
        }
        responder.await.unwrap();
    }
}
