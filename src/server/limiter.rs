//! Handshake abuse limiting
//!
//! Each source IP may start a bounded number of handshakes per sliding
//! one-minute window. Live-session caps per IP are enforced by the session
//! table, which already knows every peer address.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Length of the sliding window
pub const HANDSHAKE_WINDOW: Duration = Duration::from_secs(60);

/// Per-source-IP handshake rate limiter
#[derive(Debug)]
pub struct HandshakeLimiter {
    max_per_window: u32,
    attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl HandshakeLimiter {
    /// Allow `max_per_window` handshakes per IP per minute; 0 disables the
    /// limit
    pub fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt from `ip` at `now`. Returns false when the IP is
    /// over its budget; rejected attempts are not recorded.
    pub async fn check(&self, ip: IpAddr, now: Instant) -> bool {
        if self.max_per_window == 0 {
            return true;
        }

        let mut attempts = self.attempts.lock().await;
        let window = attempts.entry(ip).or_default();

        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= HANDSHAKE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_per_window as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop IPs with no attempts inside the window
    pub async fn prune(&self, now: Instant) {
        let mut attempts = self.attempts.lock().await;
        attempts.retain(|_, window| {
            window
                .back()
                .map_or(false, |&last| now.saturating_duration_since(last) < HANDSHAKE_WINDOW)
        });
    }

    /// Number of IPs currently tracked
    pub async fn tracked(&self) -> usize {
        self.attempts.lock().await.len()
    }
}
