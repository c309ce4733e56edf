//! End-to-end tests: a real server on a loopback socket, clients over UDP,
//! and `MemoryTunnel`s standing in for TUN devices.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use phazevpn::config::{ClientConfig, ServerConfig, UserConfig};
use phazevpn::crypto::{derive_session_keys, KeyPair};
use phazevpn::error::{CryptoError, ProtocolError, TunnelError};
use phazevpn::protocol::{decode, encode, HandshakePayload, Packet, PacketType, TransportState};
use phazevpn::server::Disposition;
use phazevpn::tunnel::{MemoryTunnel, MemoryTunnelPeer, TunnelIo};
use phazevpn::{handshake, TunnelClient, TunnelConfig, TunnelServer, VpnError};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

const STEP: Duration = Duration::from_secs(5);

fn server_config() -> TunnelConfig {
    let server = ServerConfig {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    TunnelConfig {
        server: Some(server),
        ..Default::default()
    }
}

fn client_config(endpoint: SocketAddr) -> TunnelConfig {
    TunnelConfig {
        client: Some(ClientConfig::new(endpoint.to_string())),
        ..Default::default()
    }
}

async fn start_server(config: &TunnelConfig) -> (Arc<TunnelServer>, MemoryTunnelPeer) {
    let (tunnel, host) = MemoryTunnel::pair("phaze-srv");
    let server = TunnelServer::with_tunnel(config, Arc::new(tunnel)).await.unwrap();
    (Arc::new(server), host)
}

async fn wait_established(server: &TunnelServer, session_id: u32) {
    timeout(STEP, async {
        loop {
            if let Ok(session) = server.sessions().get(session_id).await {
                if session.is_established() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never became established");
}

/// Minimal IPv4 packet from `src` to `dst` carrying `body`
fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    let total = (20 + body.len()) as u16;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(body);
    packet
}

/// A hand-driven client: socket, keys and the server's reply
struct RawClient {
    socket: UdpSocket,
    keypair: KeyPair,
}

impl RawClient {
    async fn new() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            keypair: KeyPair::generate(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn init(&self) -> Vec<u8> {
        let payload = HandshakePayload::new(self.keypair.public_bytes()).encode().unwrap();
        encode(&Packet::new(PacketType::HandshakeInit, 0, 0, payload)).unwrap()
    }

    /// Read the handshake response the server sent us and derive keys
    async fn finish(&self) -> (u32, TransportState) {
        let mut buf = [0u8; 2048];
        let len = timeout(STEP, self.socket.recv(&mut buf)).await.unwrap().unwrap();
        let reply = decode(&buf[..len]).unwrap();
        assert_eq!(reply.packet_type, PacketType::HandshakeResponse);

        let response = HandshakePayload::decode(&reply.payload).unwrap();
        let shared = self.keypair.diffie_hellman(&response.public_key).unwrap();
        let keys = derive_session_keys(shared.as_bytes(), &self.keypair.public_bytes(), &response.public_key);
        (reply.session_id, TransportState::client(keys))
    }
}

#[tokio::test]
async fn test_handshake_and_data_both_directions() {
    let (server, server_host) = start_server(&server_config()).await;
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let config = client_config(server.local_addr());
    let session = handshake(&config).await.unwrap();
    assert_eq!(session.assigned_address(), "10.9.0.2/24".parse::<Ipv4Net>().unwrap());
    let session_id = session.session_id();
    wait_established(&server, session_id).await;

    let (client_tunnel, client_host) = MemoryTunnel::pair("phaze-cli");
    let client = Arc::new(TunnelClient::new(
        session,
        Arc::new(client_tunnel),
        config.client.as_ref().unwrap(),
    )
    .unwrap());
    let client_task = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let client_ip = Ipv4Addr::new(10, 9, 0, 2);
    let server_ip = Ipv4Addr::new(10, 9, 0, 1);

    // Client -> server
    let up = ipv4_packet(client_ip, server_ip, b"hello server");
    client_host.inject(up.clone()).await.unwrap();
    let delivered = timeout(STEP, server_host.next_written()).await.unwrap().unwrap();
    assert_eq!(delivered, up);

    // Server -> client, routed by destination address
    let down = ipv4_packet(server_ip, client_ip, b"hello client");
    server_host.inject(down.clone()).await.unwrap();
    let delivered = timeout(STEP, client_host.next_written()).await.unwrap().unwrap();
    assert_eq!(delivered, down);

    let stats = server.sessions().get(session_id).await.unwrap().transport.stats();
    assert_eq!(stats.packets_received, 1);
    assert_eq!(stats.packets_sent, 1);

    // Client shutdown sends DISCONNECT, which removes the session
    client.stop();
    timeout(STEP, client_task).await.unwrap().unwrap().unwrap();
    timeout(STEP, async {
        while !server.sessions().is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session not removed after disconnect");

    server.stop();
    timeout(STEP, server_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_three_sessions_get_distinct_addresses_and_keys() {
    let (server, _host) = start_server(&server_config()).await;
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let config = client_config(server.local_addr());
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = handshake(&config).await.unwrap();
        wait_established(&server, session.session_id()).await;
        sessions.push(session);
    }

    let addresses: Vec<Ipv4Addr> = sessions.iter().map(|s| s.assigned_address().addr()).collect();
    assert_eq!(
        addresses,
        vec![
            Ipv4Addr::new(10, 9, 0, 2),
            Ipv4Addr::new(10, 9, 0, 3),
            Ipv4Addr::new(10, 9, 0, 4),
        ]
    );

    // Sealed with session 0's keys but addressed to session 1
    let (a, b) = (&sessions[0], &sessions[1]);
    let forged = a.transport().seal_data(b.session_id(), b"not yours").unwrap();
    let from = SocketAddr::from(([127, 0, 0, 1], b.socket().local_addr().unwrap().port()));
    let result = server.dispatch(&encode(&forged).unwrap(), from).await;
    assert!(matches!(
        result,
        Err(VpnError::Crypto(CryptoError::AuthenticationFailed))
    ));

    // The session survives the forgery
    let genuine = b.transport().seal_data(b.session_id(), b"mine").unwrap();
    let result = server.dispatch(&encode(&genuine).unwrap(), from).await.unwrap();
    assert_eq!(
        result,
        Disposition::Delivered {
            session_id: b.session_id(),
            bytes: 4
        }
    );

    server.stop();
    timeout(STEP, server_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_times_out_against_silent_server() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = client_config(silent.local_addr().unwrap());
    config.client.as_mut().unwrap().handshake_timeout = Duration::from_millis(200);

    let started = std::time::Instant::now();
    let result = handshake(&config).await;
    assert!(matches!(
        result,
        Err(VpnError::Protocol(ProtocolError::HandshakeFailed { .. }))
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_idle_session_gets_keepalive_then_reaped() {
    let (server, host) = start_server(&server_config()).await;
    let client = RawClient::new().await;

    server.dispatch(&client.init(), client.addr()).await.unwrap();
    let (session_id, transport) = client.finish().await;
    let complete = transport.key_confirmation(session_id).unwrap();
    server.dispatch(&encode(&complete).unwrap(), client.addr()).await.unwrap();

    let now = Instant::now();

    // Nearing the timeout: sent a keepalive, not removed
    let outcome = server.reap(now + Duration::from_secs(61)).await;
    assert!(outcome.expired.is_empty());
    assert_eq!(outcome.quiet.len(), 1);

    let mut buf = [0u8; 2048];
    let len = timeout(STEP, client.socket.recv(&mut buf)).await.unwrap().unwrap();
    let keepalive = decode(&buf[..len]).unwrap();
    assert_eq!(keepalive.packet_type, PacketType::Keepalive);
    assert_eq!(keepalive.session_id, session_id);

    // Past the timeout: removed
    let outcome = server.reap(now + Duration::from_secs(121)).await;
    assert_eq!(outcome.expired.len(), 1);
    assert!(server.sessions().is_empty().await);

    // Late traffic under the old keys goes nowhere
    let late = transport.seal_data(session_id, b"after expiry").unwrap();
    let result = server.dispatch(&encode(&late).unwrap(), client.addr()).await;
    assert!(matches!(
        result,
        Err(VpnError::Protocol(ProtocolError::SessionNotFound { .. }))
    ));
    assert!(timeout(Duration::from_millis(200), host.next_written()).await.is_err());
}

#[tokio::test]
async fn test_data_dropped_until_key_confirmation() {
    let (server, host) = start_server(&server_config()).await;
    let client = RawClient::new().await;

    let accepted = server.dispatch(&client.init(), client.addr()).await.unwrap();
    assert!(matches!(accepted, Disposition::HandshakeAccepted { .. }));
    let (session_id, transport) = client.finish().await;

    let early = transport.seal_data(session_id, b"too soon").unwrap();
    let result = server.dispatch(&encode(&early).unwrap(), client.addr()).await;
    assert!(matches!(
        result,
        Err(VpnError::Protocol(ProtocolError::SessionNotEstablished { .. }))
    ));

    let complete = transport.key_confirmation(session_id).unwrap();
    let result = server.dispatch(&encode(&complete).unwrap(), client.addr()).await.unwrap();
    assert_eq!(result, Disposition::Established { session_id });

    // A repeated confirmation only refreshes liveness
    let again = transport.key_confirmation(session_id).unwrap();
    let result = server.dispatch(&encode(&again).unwrap(), client.addr()).await.unwrap();
    assert_eq!(result, Disposition::Refreshed { session_id });

    let data = transport.seal_data(session_id, b"now it flows").unwrap();
    server.dispatch(&encode(&data).unwrap(), client.addr()).await.unwrap();
    assert_eq!(host.next_written().await.unwrap(), b"now it flows");
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let (server, _host) = start_server(&server_config()).await;
    let client = RawClient::new().await;

    server.dispatch(&client.init(), client.addr()).await.unwrap();
    let (session_id, _transport) = client.finish().await;
    assert_eq!(server.sessions().len().await, 1);

    let bye = Packet::control(PacketType::Disconnect, session_id, 3);
    let result = server.dispatch(&encode(&bye).unwrap(), client.addr()).await.unwrap();
    assert_eq!(result, Disposition::Disconnected { session_id });
    assert!(server.sessions().is_empty().await);
}

#[tokio::test]
async fn test_roaming_follows_authenticated_data() {
    let (server, host) = start_server(&server_config()).await;
    let client = RawClient::new().await;

    server.dispatch(&client.init(), client.addr()).await.unwrap();
    let (session_id, transport) = client.finish().await;
    let complete = transport.key_confirmation(session_id).unwrap();
    server.dispatch(&encode(&complete).unwrap(), client.addr()).await.unwrap();

    let roamed: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let data = transport.seal_data(session_id, b"moved").unwrap();
    server.dispatch(&encode(&data).unwrap(), roamed).await.unwrap();
    host.next_written().await.unwrap();

    assert_eq!(server.sessions().get(session_id).await.unwrap().peer, roamed);

    // Unauthenticated packets never move the session
    let mut forged = transport.seal_data(session_id, b"moved again").unwrap();
    let last = forged.payload.len() - 1;
    forged.payload[last] ^= 0x01;
    let elsewhere: SocketAddr = "127.0.0.1:40002".parse().unwrap();
    assert!(server.dispatch(&encode(&forged).unwrap(), elsewhere).await.is_err());
    assert_eq!(server.sessions().get(session_id).await.unwrap().peer, roamed);
}

#[tokio::test]
async fn test_credentials_checked_when_required() {
    let mut config = server_config();
    config.server.as_mut().unwrap().require_auth = true;
    config.users.push(UserConfig {
        name: "alice".to_string(),
        password_hash: [9u8; 32],
    });
    let (server, _host) = start_server(&config).await;
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    // No credentials
    let anonymous = client_config(server.local_addr());
    match handshake(&anonymous).await {
        Err(VpnError::Protocol(ProtocolError::HandshakeFailed { reason })) => {
            assert_eq!(reason, "authentication failed");
        }
        other => panic!("expected rejection, got {:?}", other.map(|s| s.session_id())),
    }

    // Wrong password
    let mut wrong = client_config(server.local_addr());
    let client = wrong.client.as_mut().unwrap();
    client.username = Some("alice".to_string());
    client.password_hash = Some([8u8; 32]);
    assert!(handshake(&wrong).await.is_err());

    // Right password
    let mut right = client_config(server.local_addr());
    let client = right.client.as_mut().unwrap();
    client.username = Some("alice".to_string());
    client.password_hash = Some([9u8; 32]);
    let session = handshake(&right).await.unwrap();

    let stored = server.sessions().get(session.session_id()).await.unwrap();
    assert_eq!(stored.username.as_deref(), Some("alice"));

    server.stop();
    timeout(STEP, server_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_rate_limit_per_source() {
    let mut config = server_config();
    config.server.as_mut().unwrap().max_sessions_per_address = 0;
    let (server, _host) = start_server(&config).await;
    let client = RawClient::new().await;

    for _ in 0..5 {
        let result = server.dispatch(&client.init(), client.addr()).await.unwrap();
        assert!(matches!(result, Disposition::HandshakeAccepted { .. }));
    }

    let result = server.dispatch(&client.init(), client.addr()).await.unwrap();
    assert_eq!(
        result,
        Disposition::HandshakeRejected {
            reason: "Too many handshakes from 127.0.0.1".to_string()
        }
    );
    assert_eq!(server.sessions().len().await, 5);
}

#[tokio::test]
async fn test_session_cap_per_source() {
    let (server, _host) = start_server(&server_config()).await;
    let client = RawClient::new().await;

    for _ in 0..3 {
        server.dispatch(&client.init(), client.addr()).await.unwrap();
    }

    let result = server.dispatch(&client.init(), client.addr()).await.unwrap();
    match result {
        Disposition::HandshakeRejected { reason } => {
            assert_eq!(reason, "Too many sessions from 127.0.0.1");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(server.sessions().len().await, 3);
}

#[tokio::test]
async fn test_server_shutdown_terminates_client() {
    let (server, _server_host) = start_server(&server_config()).await;
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let config = client_config(server.local_addr());
    let session = handshake(&config).await.unwrap();
    wait_established(&server, session.session_id()).await;

    let (client_tunnel, _client_host) = MemoryTunnel::pair("phaze-cli");
    let client = TunnelClient::new(session, Arc::new(client_tunnel), config.client.as_ref().unwrap()).unwrap();
    let client_task = tokio::spawn(async move { client.run().await });

    server.stop();
    timeout(STEP, server_task).await.unwrap().unwrap().unwrap();

    let result = timeout(STEP, client_task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(VpnError::Protocol(ProtocolError::SessionTerminated { .. }))
    ));
}

/// Tunnel whose writes never complete, pinning any packet sent to it
struct StuckTunnel;

#[async_trait]
impl TunnelIo for StuckTunnel {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn read_packet(&self, _buf: &mut [u8]) -> Result<usize, TunnelError> {
        std::future::pending().await
    }

    async fn write_packet(&self, _packet: &[u8]) -> Result<(), TunnelError> {
        std::future::pending().await
    }

    async fn close(&self) -> Result<(), TunnelError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_gives_up_on_stuck_packets() {
    let mut config = server_config();
    config.server.as_mut().unwrap().shutdown_timeout = Duration::from_millis(200);
    let server = Arc::new(TunnelServer::with_tunnel(&config, Arc::new(StuckTunnel)).await.unwrap());
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let client = RawClient::new().await;
    client.socket.send_to(&client.init(), server.local_addr()).await.unwrap();
    let (session_id, transport) = client.finish().await;
    let complete = transport.key_confirmation(session_id).unwrap();
    client
        .socket
        .send_to(&encode(&complete).unwrap(), server.local_addr())
        .await
        .unwrap();
    wait_established(&server, session_id).await;

    // This packet's dispatch task never finishes
    let packet = ipv4_packet(Ipv4Addr::new(10, 9, 0, 2), Ipv4Addr::new(10, 9, 0, 1), b"stuck");
    let data = transport.seal_data(session_id, &packet).unwrap();
    client.socket.send_to(&encode(&data).unwrap(), server.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.stop();
    timeout(STEP, server_task).await.unwrap().unwrap().unwrap();
    assert!(server.sessions().is_empty().await);

    let mut buf = [0u8; 2048];
    let len = timeout(STEP, client.socket.recv(&mut buf)).await.unwrap().unwrap();
    let bye = decode(&buf[..len]).unwrap();
    assert_eq!(bye.packet_type, PacketType::Disconnect);
    assert_eq!(bye.session_id, session_id);
}
