//! Server session table
//!
//! Tracks every session by id and by assigned tunnel address. The table is
//! behind a single async `RwLock`; callers get cloned `Session` values and
//! do all crypto on the shared `TransportState` after the lock is released.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::pool::AddressPool;
use crate::error::ProtocolError;
use crate::protocol::TransportState;

/// Session lifecycle. A closed session is simply absent from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Response sent, waiting for the client's key confirmation
    AwaitingComplete,
    /// Key confirmation received; DATA flows
    Established,
}

/// Session state for one connected client
#[derive(Debug, Clone)]
pub struct Session {
    /// Random non-zero id carried in every packet header
    pub id: u32,
    /// Last authenticated source address of the client
    pub peer: SocketAddr,
    /// Transport encryption state
    pub transport: Arc<TransportState>,
    /// Tunnel address assigned to the client
    pub tunnel_address: Ipv4Addr,
    /// Username presented at handshake, if any
    pub username: Option<String>,
    pub state: SessionState,
    /// When the handshake was accepted
    pub created_at: Instant,
    /// Last time any valid packet arrived
    pub last_seen: Instant,
}

impl Session {
    /// Time since the last valid packet
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Time since the handshake was accepted
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Whether DATA may flow
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }
}

/// Result of one reaper pass
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// Sessions removed for exceeding the idle timeout
    pub expired: Vec<Session>,
    /// Sessions nearing the timeout that get a keepalive
    pub quiet: Vec<Session>,
}

struct TableInner {
    sessions: HashMap<u32, Session>,
    by_address: HashMap<Ipv4Addr, u32>,
    pool: AddressPool,
}

impl TableInner {
    fn remove(&mut self, id: u32) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.by_address.remove(&session.tunnel_address);
        self.pool.release(session.tunnel_address);
        Some(session)
    }

    fn sessions_from(&self, ip: IpAddr) -> usize {
        self.sessions.values().filter(|s| s.peer.ip() == ip).count()
    }

    fn fresh_id(&self) -> u32 {
        loop {
            let id = OsRng.next_u32();
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Concurrent session table
pub struct SessionTable {
    inner: RwLock<TableInner>,
    /// Live sessions allowed per source IP (0 = unlimited)
    max_sessions_per_address: usize,
    server_address: Ipv4Net,
}

impl SessionTable {
    /// Create an empty table allocating tunnel addresses from `network`
    pub fn new(network: Ipv4Net, max_sessions_per_address: usize) -> Self {
        let pool = AddressPool::new(network);
        let server_address = pool.server_address();
        Self {
            inner: RwLock::new(TableInner {
                sessions: HashMap::new(),
                by_address: HashMap::new(),
                pool,
            }),
            max_sessions_per_address,
            server_address,
        }
    }

    /// Server's own tunnel address
    pub fn server_address(&self) -> Ipv4Net {
        self.server_address
    }

    /// Admit a new session in `AwaitingComplete`, allocating its id and
    /// tunnel address. Returns the stored session.
    pub async fn insert(
        &self,
        peer: SocketAddr,
        transport: Arc<TransportState>,
        username: Option<String>,
        now: Instant,
    ) -> Result<Session, ProtocolError> {
        let mut inner = self.inner.write().await;

        if self.max_sessions_per_address > 0 && inner.sessions_from(peer.ip()) >= self.max_sessions_per_address {
            return Err(ProtocolError::SessionLimitReached {
                address: peer.ip().to_string(),
            });
        }

        let tunnel_address = inner.pool.allocate().ok_or(ProtocolError::AddressPoolExhausted)?;
        let id = inner.fresh_id();

        let session = Session {
            id,
            peer,
            transport,
            tunnel_address,
            username,
            state: SessionState::AwaitingComplete,
            created_at: now,
            last_seen: now,
        };

        inner.by_address.insert(tunnel_address, id);
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Tunnel address of a client address with the network prefix attached
    pub fn client_network(&self, addr: Ipv4Addr) -> Ipv4Net {
        Ipv4Net::new(addr, self.server_address.prefix_len()).unwrap_or(self.server_address)
    }

    /// Look up a session by id
    pub async fn get(&self, id: u32) -> Result<Session, ProtocolError> {
        self.inner
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::SessionNotFound { session_id: id })
    }

    /// Mark a session established after key confirmation. Returns false if
    /// it already was.
    pub async fn establish(&self, id: u32, now: Instant) -> Result<bool, ProtocolError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(ProtocolError::SessionNotFound { session_id: id })?;

        session.last_seen = now;
        if session.state == SessionState::Established {
            return Ok(false);
        }
        session.state = SessionState::Established;
        Ok(true)
    }

    /// Refresh liveness of a session
    pub async fn touch(&self, id: u32, now: Instant) -> Result<(), ProtocolError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(ProtocolError::SessionNotFound { session_id: id })?;
        session.last_seen = now;
        Ok(())
    }

    /// Refresh liveness after an authenticated packet from `from`, following
    /// the client if its address changed. Returns the previous address on a
    /// change.
    pub async fn touch_from(&self, id: u32, from: SocketAddr, now: Instant) -> Result<Option<SocketAddr>, ProtocolError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(ProtocolError::SessionNotFound { session_id: id })?;

        session.last_seen = now;
        if session.peer == from {
            return Ok(None);
        }
        let previous = session.peer;
        session.peer = from;
        Ok(Some(previous))
    }

    /// Remove a session and release its tunnel address
    pub async fn remove(&self, id: u32) -> Option<Session> {
        self.inner.write().await.remove(id)
    }

    /// Established session owning tunnel address `dest`
    pub async fn route(&self, dest: Ipv4Addr) -> Option<Session> {
        let inner = self.inner.read().await;
        let id = inner.by_address.get(&dest)?;
        inner.sessions.get(id).filter(|s| s.is_established()).cloned()
    }

    /// Remove sessions idle for longer than `timeout` and collect the ones
    /// idle for at least half of it
    pub async fn reap(&self, now: Instant, timeout: Duration) -> ReapOutcome {
        let mut inner = self.inner.write().await;

        let expired_ids: Vec<u32> = inner
            .sessions
            .values()
            .filter(|s| s.idle(now) > timeout)
            .map(|s| s.id)
            .collect();

        let mut outcome = ReapOutcome::default();
        for id in expired_ids {
            if let Some(session) = inner.remove(id) {
                outcome.expired.push(session);
            }
        }

        outcome.quiet = inner
            .sessions
            .values()
            .filter(|s| s.idle(now) >= timeout / 2)
            .cloned()
            .collect();

        outcome
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cloned view of every session
    pub async fn sessions(&self) -> Vec<Session> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Remove every session; returns them so callers can notify clients
    pub async fn clear(&self) -> Vec<Session> {
        let mut inner = self.inner.write().await;
        let ids: Vec<u32> = inner.sessions.keys().copied().collect();
        ids.into_iter().filter_map(|id| inner.remove(id)).collect()
    }
}
