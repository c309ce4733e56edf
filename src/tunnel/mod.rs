//! Tunnel interface abstraction layer
//!
//! `TunnelIo` is the seam between the packet relay and wherever IP packets
//! come from:
//! - `TunDevice`: a real TUN device via the tun-rs crate
//! - `RelayOnly`: no device; reads never complete and writes are dropped
//! - `MemoryTunnel`: an in-process channel pair, for tests and embedding

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::{mpsc, watch, Mutex};
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::config::InterfaceConfig;
use crate::error::{TunnelError, VpnError};

/// Async packet I/O against a tunnel interface
#[async_trait]
pub trait TunnelIo: Send + Sync {
    /// Interface name for logs
    fn name(&self) -> &str;

    /// Read one IP packet into `buf`, waiting until one is available
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Write one IP packet to the interface
    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError>;

    /// Close the interface. Pending and later reads fail with `Closed`.
    async fn close(&self) -> Result<(), TunnelError>;
}

/// Close signal shared by every tunnel implementation
struct CloseSignal(watch::Sender<bool>);

impl CloseSignal {
    fn new() -> Self {
        Self(watch::channel(false).0)
    }

    fn close(&self) {
        self.0.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.0.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Async TUN device wrapper
pub struct TunDevice {
    /// The underlying async TUN device; taken on close so the descriptor is
    /// released once in-flight reads and writes return
    device: Mutex<Option<Arc<AsyncDevice>>>,
    /// Device name (e.g., "utun5", "tun0")
    name: String,
    closed: CloseSignal,
}

impl TunDevice {
    /// Create a TUN device, assign `address` and bring it up
    pub async fn create(name: Option<&str>, address: Ipv4Net, mtu: u16) -> Result<Self, TunnelError> {
        // Check for required privileges first
        check_privileges()?;

        let mut builder = DeviceBuilder::new();

        // macOS insists on utunN names
        #[cfg(target_os = "linux")]
        {
            if let Some(name) = name {
                builder = builder.name(name);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = name;

        let device = builder
            .ipv4(address.addr(), address.prefix_len(), None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::InterfaceUnavailable {
                reason: e.to_string(),
            })?;

        let name = device.deref().name().map_err(|e| TunnelError::InterfaceUnavailable {
            reason: format!("Failed to get device name: {}", e),
        })?;

        tracing::info!("Created TUN device: {} with address {}", name, address);

        Ok(Self {
            device: Mutex::new(Some(Arc::new(device))),
            name,
            closed: CloseSignal::new(),
        })
    }

    async fn device(&self) -> Result<Arc<AsyncDevice>, TunnelError> {
        self.device.lock().await.clone().ok_or(TunnelError::Closed)
    }
}

#[async_trait]
impl TunnelIo for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let device = self.device().await?;

        tokio::select! {
            result = device.recv(buf) => result.map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            }),
            _ = self.closed.closed() => Err(TunnelError::Closed),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError> {
        self.device()
            .await?
            .send(packet)
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.closed.close();
        if self.device.lock().await.take().is_some() {
            tracing::info!("Closed TUN device {}", self.name);
        }
        Ok(())
    }
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), TunnelError> {
    #[cfg(unix)]
    {
        // On Unix, we need root or CAP_NET_ADMIN
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // CAP_NET_ADMIN may still be granted; let creation decide
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./phazevpn");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InterfaceUnavailable {
                    reason: "root privileges required on macOS".to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Tunnel without an interface: the session layer keeps running, but no
/// packets are exchanged with the host.
pub struct RelayOnly {
    closed: CloseSignal,
}

impl RelayOnly {
    pub fn new() -> Self {
        Self {
            closed: CloseSignal::new(),
        }
    }
}

impl Default for RelayOnly {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelIo for RelayOnly {
    fn name(&self) -> &str {
        "relay-only"
    }

    async fn read_packet(&self, _buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.closed.closed().await;
        Err(TunnelError::Closed)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError> {
        tracing::trace!("Relay-only: discarding {} byte packet", packet.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.closed.close();
        Ok(())
    }
}

/// Depth of each direction of a `MemoryTunnel`
const MEMORY_TUNNEL_DEPTH: usize = 256;

/// Channel-backed tunnel. Packets written by the relay appear on the
/// paired `MemoryTunnelPeer`, and packets the peer injects are read by the
/// relay.
pub struct MemoryTunnel {
    name: String,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CloseSignal,
}

/// Host side of a `MemoryTunnel`
pub struct MemoryTunnelPeer {
    to_tunnel: mpsc::Sender<Vec<u8>>,
    from_tunnel: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl MemoryTunnel {
    /// Create a tunnel and the handle that plays the host's role
    pub fn pair(name: impl Into<String>) -> (Self, MemoryTunnelPeer) {
        let (to_tunnel, inbound) = mpsc::channel(MEMORY_TUNNEL_DEPTH);
        let (outbound, from_tunnel) = mpsc::channel(MEMORY_TUNNEL_DEPTH);

        let tunnel = Self {
            name: name.into(),
            inbound: Mutex::new(inbound),
            outbound,
            closed: CloseSignal::new(),
        };
        let peer = MemoryTunnelPeer {
            to_tunnel,
            from_tunnel: Mutex::new(from_tunnel),
        };
        (tunnel, peer)
    }
}

#[async_trait]
impl TunnelIo for MemoryTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if self.closed.is_closed() {
            return Err(TunnelError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        let packet = tokio::select! {
            packet = inbound.recv() => packet.ok_or(TunnelError::Closed)?,
            _ = self.closed.closed() => return Err(TunnelError::Closed),
        };

        if packet.len() > buf.len() {
            return Err(TunnelError::ReadFailed {
                reason: format!("{} byte packet exceeds {} byte buffer", packet.len(), buf.len()),
            });
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError> {
        if self.closed.is_closed() {
            return Err(TunnelError::Closed);
        }

        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| TunnelError::WriteFailed {
                reason: "peer handle dropped".to_string(),
            })
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.closed.close();
        Ok(())
    }
}

impl MemoryTunnelPeer {
    /// Hand a packet to the tunnel as if the host had routed it there
    pub async fn inject(&self, packet: Vec<u8>) -> Result<(), TunnelError> {
        self.to_tunnel
            .send(packet)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Next packet the relay delivered to the host; `None` once the tunnel
    /// is gone
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.from_tunnel.lock().await.recv().await
    }
}

/// Open the tunnel interface for `address`.
///
/// When the device cannot be created and `allow_relay_only` is set, fall
/// back to `RelayOnly` so the session layer still runs.
pub async fn open_tunnel(config: &InterfaceConfig, address: Ipv4Net) -> Result<Arc<dyn TunnelIo>, VpnError> {
    match TunDevice::create(config.name.as_deref(), address, config.mtu).await {
        Ok(device) => Ok(Arc::new(device)),
        Err(TunnelError::InterfaceUnavailable { reason }) if config.allow_relay_only => {
            tracing::warn!(
                "Tunnel interface unavailable ({}); continuing in relay-only mode",
                reason
            );
            Ok(Arc::new(RelayOnly::new()))
        }
        Err(e) => Err(e.into()),
    }
}
