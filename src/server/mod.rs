//! PhazeVPN server orchestration
//!
//! Main event loop for server mode that handles:
//! - Receiving datagrams and dispatching each on its own task, bounded by a
//!   semaphore
//! - Accepting handshakes and tracking sessions
//! - Routing packets between the tunnel and clients by tunnel address
//! - Reaping idle sessions and probing quiet ones with keepalives

pub mod limiter;
pub mod pool;
pub mod table;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval_at, timeout, Instant};

use crate::config::{ServerConfig, TunnelConfig};
use crate::crypto::password::{verify_password_hash, PASSWORD_HASH_LEN};
use crate::crypto::{derive_session_keys, KeyPair};
use crate::error::{ConfigError, CryptoError, NetworkError, ProtocolError, TunnelError, VpnError};
use crate::protocol::{self, HandshakePayload, Packet, PacketType, TransportState};
use crate::tunnel::{open_tunnel, TunnelIo};

pub use limiter::HandshakeLimiter;
pub use pool::AddressPool;
pub use table::{ReapOutcome, Session, SessionState, SessionTable};

/// Buffer size for packets
const BUFFER_SIZE: usize = 65535;

/// What the server did with one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handshake accepted; response sent
    HandshakeAccepted { session_id: u32, address: Ipv4Addr },
    /// Handshake refused; ERROR packet sent
    HandshakeRejected { reason: String },
    /// Key confirmation verified; session established
    Established { session_id: u32 },
    /// Repeated key confirmation for an established session
    Refreshed { session_id: u32 },
    /// DATA decrypted and written to the tunnel
    Delivered { session_id: u32, bytes: usize },
    /// Keepalive recorded
    KeptAlive { session_id: u32 },
    /// Session removed at the client's request
    Disconnected { session_id: u32 },
}

/// Per-datagram handling shared by all dispatch tasks
struct Dispatcher {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    tunnel: Arc<dyn TunnelIo>,
    sessions: SessionTable,
    limiter: HandshakeLimiter,
    users: HashMap<String, [u8; PASSWORD_HASH_LEN]>,
}

impl Dispatcher {
    /// Decode and act on one datagram from `from`
    pub async fn dispatch(&self, datagram: &[u8], from: SocketAddr) -> Result<Disposition, VpnError> {
        let packet = protocol::decode(datagram)?;
        let now = Instant::now();

        match packet.packet_type {
            PacketType::HandshakeInit => self.handle_init(&packet, from, now).await,
            PacketType::HandshakeComplete => self.handle_complete(&packet, now).await,
            PacketType::Data => self.handle_data(&packet, from, now).await,
            PacketType::Keepalive => {
                self.sessions.touch(packet.session_id, now).await?;
                Ok(Disposition::KeptAlive {
                    session_id: packet.session_id,
                })
            }
            PacketType::Disconnect => self.handle_disconnect(&packet).await,
            // Responses and errors only flow server -> client
            PacketType::HandshakeResponse | PacketType::Error => Err(ProtocolError::UnexpectedPacket {
                packet_type: packet.packet_type.name(),
            }
            .into()),
        }
    }

    /// Dispatch and log; per-packet failures end here
    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        match self.dispatch(datagram, from).await {
            Ok(disposition) => tracing::trace!("{}: {:?}", from, disposition),
            Err(e) => log_dropped(&e, from),
        }
    }

    /// Process a handshake initiation from a client
    async fn handle_init(&self, packet: &Packet, from: SocketAddr, now: Instant) -> Result<Disposition, VpnError> {
        if packet.session_id != 0 {
            return Err(ProtocolError::MalformedPacket("handshake init with non-zero session id").into());
        }

        // 1. Per-source rate limit
        if !self.limiter.check(from.ip(), now).await {
            let limited = ProtocolError::RateLimited {
                address: from.ip().to_string(),
            };
            return self.reject(from, &limited.to_string()).await;
        }

        // 2. Parse payload
        let init = HandshakePayload::decode(&packet.payload)?;

        // 3. Legacy credentials
        if let Err(e) = self.authenticate(&init) {
            tracing::warn!("Rejected handshake from {}: {}", from, e);
            return self.reject(from, "authentication failed").await;
        }

        // 4. Ephemeral key exchange, outside the table lock
        let ephemeral = KeyPair::generate();
        let server_public = ephemeral.public_bytes();
        let shared = ephemeral.diffie_hellman(&init.public_key)?;
        let keys = derive_session_keys(shared.as_bytes(), &init.public_key, &server_public);
        drop(shared);
        let transport = Arc::new(TransportState::server(keys));

        // 5. Admit into the table
        let session = match self
            .sessions
            .insert(from, transport.clone(), init.username.clone(), now)
            .await
        {
            Ok(session) => session,
            Err(e @ (ProtocolError::AddressPoolExhausted | ProtocolError::SessionLimitReached { .. })) => {
                tracing::warn!("Refusing session for {}: {}", from, e);
                return self.reject(from, &e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        };

        // 6. Respond with our key and the assigned address
        let address = self.sessions.client_network(session.tunnel_address);
        let response = HandshakePayload::new(server_public).with_address(address);
        let reply = Packet::new(
            PacketType::HandshakeResponse,
            session.id,
            transport.next_sequence(),
            response.encode()?,
        );
        if let Err(e) = self.send(&reply, from).await {
            self.sessions.remove(session.id).await;
            return Err(e);
        }

        tracing::info!(
            "Handshake accepted from {} (session {:08x}, user {}, address {})",
            from,
            session.id,
            session.username.as_deref().unwrap_or("-"),
            address
        );

        Ok(Disposition::HandshakeAccepted {
            session_id: session.id,
            address: session.tunnel_address,
        })
    }

    /// Check optional username/password credentials
    fn authenticate(&self, init: &HandshakePayload) -> Result<(), ProtocolError> {
        match (&init.username, &init.password_hash) {
            (Some(user), Some(presented)) => {
                // Unknown users still pay for a comparison
                let expected = self.users.get(user).copied().unwrap_or([0u8; PASSWORD_HASH_LEN]);
                if self.users.contains_key(user) && verify_password_hash(&expected, presented) {
                    Ok(())
                } else {
                    Err(ProtocolError::AuthenticationRejected { user: user.clone() })
                }
            }
            (None, None) if !self.config.require_auth => Ok(()),
            (user, _) => Err(ProtocolError::AuthenticationRejected {
                user: user.clone().unwrap_or_else(|| "anonymous".to_string()),
            }),
        }
    }

    /// Process a client's key confirmation
    async fn handle_complete(&self, packet: &Packet, now: Instant) -> Result<Disposition, VpnError> {
        let session = self.sessions.get(packet.session_id).await?;
        let session_id = session.id;

        if session.is_established() {
            self.sessions.touch(session_id, now).await?;
            return Ok(Disposition::Refreshed { session_id });
        }

        session.transport.verify_confirmation(packet)?;
        self.sessions.establish(session_id, now).await?;

        tracing::info!("Session {:08x} established with {}", session_id, session.peer);
        Ok(Disposition::Established { session_id })
    }

    /// Decrypt DATA and hand the IP packet to the tunnel
    async fn handle_data(&self, packet: &Packet, from: SocketAddr, now: Instant) -> Result<Disposition, VpnError> {
        let session = self.sessions.get(packet.session_id).await?;
        let session_id = session.id;

        if !session.is_established() {
            return Err(ProtocolError::SessionNotEstablished { session_id }.into());
        }

        let plaintext = session.transport.open_data(packet)?;

        // Update endpoint if changed (roaming)
        if let Some(previous) = self.sessions.touch_from(session_id, from, now).await? {
            tracing::info!(
                "Session {:08x} endpoint changed from {} to {}",
                session_id,
                previous,
                from
            );
        }

        if !plaintext.is_empty() {
            self.tunnel.write_packet(&plaintext).await?;
        }

        Ok(Disposition::Delivered {
            session_id,
            bytes: plaintext.len(),
        })
    }

    async fn handle_disconnect(&self, packet: &Packet) -> Result<Disposition, VpnError> {
        let session = self
            .sessions
            .remove(packet.session_id)
            .await
            .ok_or(ProtocolError::SessionNotFound {
                session_id: packet.session_id,
            })?;

        let stats = session.transport.stats();
        tracing::info!(
            "Session {:08x} from {} disconnected (sent {} bytes, received {} bytes)",
            session.id,
            session.peer,
            stats.bytes_sent,
            stats.bytes_received
        );
        Ok(Disposition::Disconnected {
            session_id: session.id,
        })
    }

    /// Route an IP packet read from the tunnel to the owning client
    pub async fn forward_from_tunnel(&self, ip_packet: &[u8]) -> Result<(), VpnError> {
        let dest = parse_ipv4_dest(ip_packet)?;

        let session = self.sessions.route(dest).await.ok_or_else(|| {
            tracing::trace!("No session for {}", dest);
            NetworkError::SendFailed {
                reason: format!("no session for {}", dest),
            }
        })?;

        let packet = session.transport.seal_data(session.id, ip_packet)?;
        self.send(&packet, session.peer).await
    }

    /// Remove idle sessions and ping quiet ones
    pub async fn reap(&self, now: Instant) -> ReapOutcome {
        let outcome = self.sessions.reap(now, self.config.session_timeout).await;

        for session in &outcome.expired {
            let stats = session.transport.stats();
            tracing::info!(
                "Session {:08x} from {} timed out after {}s ({} packets in, {} packets out)",
                session.id,
                session.peer,
                session.age(now).as_secs(),
                stats.packets_received,
                stats.packets_sent
            );
        }

        for session in &outcome.quiet {
            let keepalive = Packet::control(
                PacketType::Keepalive,
                session.id,
                session.transport.next_sequence(),
            );
            if let Err(e) = self.send(&keepalive, session.peer).await {
                tracing::debug!("Keepalive to {} failed: {}", session.peer, e);
            }
        }

        self.limiter.prune(now).await;
        let tracked = self.limiter.tracked().await;
        tracing::trace!("Handshake limiter tracking {} sources", tracked);
        outcome
    }

    /// Answer a refused handshake with an ERROR packet
    async fn reject(&self, to: SocketAddr, reason: &str) -> Result<Disposition, VpnError> {
        self.send(&Packet::error(0, reason), to).await?;
        Ok(Disposition::HandshakeRejected {
            reason: reason.to_string(),
        })
    }

    async fn send(&self, packet: &Packet, to: SocketAddr) -> Result<(), VpnError> {
        let bytes = protocol::encode(packet)?;
        self.socket
            .send_to(&bytes, to)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// PhazeVPN server
pub struct TunnelServer {
    dispatcher: Arc<Dispatcher>,
    /// Bounds the number of datagrams being processed at once
    in_flight: Arc<Semaphore>,
    max_in_flight: u32,
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl TunnelServer {
    /// Bind the UDP socket and open the tunnel interface
    pub async fn bind(config: &TunnelConfig) -> Result<Self, VpnError> {
        let server = server_section(config)?;
        let address = AddressPool::new(server.network).server_address();
        let tunnel = open_tunnel(&config.interface, address).await?;
        Self::with_tunnel(config, tunnel).await
    }

    /// Bind the UDP socket and serve packets through an existing tunnel
    pub async fn with_tunnel(config: &TunnelConfig, tunnel: Arc<dyn TunnelIo>) -> Result<Self, VpnError> {
        let server = server_section(config)?.clone();
        server.validate()?;

        let socket = bind_socket(server.listen_address, server.socket_buffer)?;
        let local_addr = socket.local_addr().map_err(NetworkError::Io)?;

        let sessions = SessionTable::new(server.network, server.max_sessions_per_address);
        tracing::info!(
            "Server listening on UDP {} (tunnel {} via {})",
            local_addr,
            sessions.server_address(),
            tunnel.name()
        );

        let users = config
            .users
            .iter()
            .map(|u| (u.name.clone(), u.password_hash))
            .collect();

        let max_in_flight = server.max_in_flight.min(Semaphore::MAX_PERMITS).min(u32::MAX as usize);
        let dispatcher = Dispatcher {
            limiter: HandshakeLimiter::new(server.max_handshakes_per_minute),
            config: server,
            socket: Arc::new(socket),
            tunnel,
            sessions,
            users,
        };

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight: max_in_flight as u32,
            shutdown_tx: watch::channel(false).0,
            local_addr,
        })
    }

    /// Address the UDP socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live session table
    pub fn sessions(&self) -> &SessionTable {
        &self.dispatcher.sessions
    }

    /// Handle one datagram inline, returning what happened to it
    pub async fn dispatch(&self, datagram: &[u8], from: SocketAddr) -> Result<Disposition, VpnError> {
        self.dispatcher.dispatch(datagram, from).await
    }

    /// Run one reaper pass as of `now`
    pub async fn reap(&self, now: Instant) -> ReapOutcome {
        self.dispatcher.reap(now).await
    }

    /// Run the server until `stop` is called, then tear down
    pub async fn run(&self) -> Result<(), VpnError> {
        let result = self.event_loop().await;
        self.teardown().await?;
        result
    }

    /// Ask a running server to shut down gracefully
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Main event loop
    async fn event_loop(&self) -> Result<(), VpnError> {
        let mut udp_buf = vec![0u8; BUFFER_SIZE];
        let mut tun_buf = vec![0u8; BUFFER_SIZE];
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let period = self.dispatcher.config.reaper_interval;
        let mut reaper = interval_at(Instant::now() + period, period);

        let mut tunnel_open = true;
        let mut permit: Option<OwnedSemaphorePermit> = None;

        tracing::info!("Server event loop started");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            // Backpressure: hold a slot before reading the next packet
            if permit.is_none() {
                permit = tokio::select! {
                    acquired = self.in_flight.clone().acquire_owned() => match acquired {
                        Ok(p) => Some(p),
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
            }

            tokio::select! {
                // Read from UDP -> dispatch on its own task
                result = self.dispatcher.socket.recv_from(&mut udp_buf) => {
                    match result {
                        Ok((len, from)) => {
                            let datagram = udp_buf[..len].to_vec();
                            let dispatcher = self.dispatcher.clone();
                            let held = permit.take();
                            tokio::spawn(async move {
                                let _held = held;
                                dispatcher.handle_datagram(&datagram, from).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!("UDP recv error: {}", e);
                        }
                    }
                }

                // Read from tunnel -> find session -> encrypt -> send via UDP
                result = self.dispatcher.tunnel.read_packet(&mut tun_buf), if tunnel_open => {
                    match result {
                        Ok(len) => {
                            let ip_packet = tun_buf[..len].to_vec();
                            let dispatcher = self.dispatcher.clone();
                            let held = permit.take();
                            tokio::spawn(async move {
                                let _held = held;
                                if let Err(e) = dispatcher.forward_from_tunnel(&ip_packet).await {
                                    tracing::trace!("Error handling tunnel packet: {}", e);
                                }
                            });
                        }
                        Err(TunnelError::Closed) => {
                            tracing::info!("Tunnel closed; no longer reading from it");
                            tunnel_open = false;
                        }
                        Err(e) => {
                            tracing::error!("Tunnel read error: {}", e);
                        }
                    }
                }

                // Periodic idle-session reaping
                _ = reaper.tick() => {
                    let outcome = self.dispatcher.reap(Instant::now()).await;
                    if !outcome.expired.is_empty() {
                        let active = self.dispatcher.sessions.len().await;
                        tracing::info!("Reaped {} idle sessions ({} active)", outcome.expired.len(), active);
                    }
                }

                _ = shutdown_rx.changed() => break,
            }
        }

        Ok(())
    }

    /// Wait for in-flight packets, drop every session and close the tunnel
    async fn teardown(&self) -> Result<(), VpnError> {
        tracing::info!("Server shutting down...");

        // Every permit back means every dispatch task has finished
        let limit = self.dispatcher.config.shutdown_timeout;
        match timeout(limit, self.in_flight.acquire_many(self.max_in_flight)).await {
            Ok(Ok(_drained)) => {}
            Ok(Err(_)) => tracing::warn!("In-flight semaphore closed before drain"),
            Err(_) => tracing::warn!(
                "{} packets still in flight after {:?}; closing anyway",
                self.max_in_flight as usize - self.in_flight.available_permits(),
                limit
            ),
        }

        let sessions = self.dispatcher.sessions.clear().await;
        for session in &sessions {
            let bye = Packet::control(
                PacketType::Disconnect,
                session.id,
                session.transport.next_sequence(),
            );
            if let Err(e) = self.dispatcher.send(&bye, session.peer).await {
                tracing::debug!("Disconnect to {} failed: {}", session.peer, e);
            }
        }

        self.dispatcher.tunnel.close().await?;
        tracing::info!("Server shutdown complete ({} sessions closed)", sessions.len());
        Ok(())
    }
}

fn server_section(config: &TunnelConfig) -> Result<&ServerConfig, VpnError> {
    config.server.as_ref().ok_or_else(|| {
        ConfigError::MissingField {
            field: "[Server] section".to_string(),
        }
        .into()
    })
}

/// Bind a UDP socket with enlarged buffers. Buffer sizing is best effort.
fn bind_socket(addr: SocketAddr, buffer_size: usize) -> Result<UdpSocket, NetworkError> {
    let bind_failed = |e: std::io::Error| NetworkError::BindFailed {
        addr: addr.to_string(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_failed)?;

    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        tracing::warn!("Could not set UDP receive buffer to {} bytes: {}", buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        tracing::warn!("Could not set UDP send buffer to {} bytes: {}", buffer_size, e);
    }

    socket.set_nonblocking(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed)
}

/// Log a dropped packet at a level matching how unusual it is
fn log_dropped(error: &VpnError, from: SocketAddr) {
    match error {
        VpnError::Protocol(ProtocolError::SessionNotFound { .. }) => {
            tracing::trace!("Dropped packet from {}: {}", from, error)
        }
        VpnError::Protocol(
            ProtocolError::MalformedPacket(_)
            | ProtocolError::UnexpectedPacket { .. }
            | ProtocolError::SessionNotEstablished { .. },
        )
        | VpnError::Crypto(CryptoError::AuthenticationFailed | CryptoError::InvalidPublicKey) => {
            tracing::debug!("Dropped packet from {}: {}", from, error)
        }
        _ => tracing::warn!("Dropped packet from {}: {}", from, error),
    }
}

/// Parse destination IPv4 address from an IP packet
pub fn parse_ipv4_dest(packet: &[u8]) -> Result<Ipv4Addr, ProtocolError> {
    if packet.len() < 20 {
        return Err(ProtocolError::MalformedPacket("IP packet shorter than IPv4 header"));
    }

    // Check IP version
    if packet[0] >> 4 != 4 {
        return Err(ProtocolError::MalformedPacket("not an IPv4 packet"));
    }

    // IPv4 destination is bytes 16-19
    Ok(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_dest() {
        // Minimal valid IPv4 header with destination 10.9.0.2
        let mut packet = [0u8; 20];
        packet[0] = 0x45; // Version 4, IHL 5
        packet[16] = 10;
        packet[17] = 9;
        packet[18] = 0;
        packet[19] = 2;

        let dest = parse_ipv4_dest(&packet).unwrap();
        assert_eq!(dest, Ipv4Addr::new(10, 9, 0, 2));
    }

    #[test]
    fn test_parse_ipv4_dest_rejects_short_and_ipv6() {
        assert!(parse_ipv4_dest(&[0x45; 10]).is_err());

        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        assert!(parse_ipv4_dest(&v6).is_err());
    }
}
