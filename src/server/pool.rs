//! Tunnel address pool
//!
//! The server keeps the first host address of the network; clients get the
//! following addresses in order. Released addresses are only handed out
//! again once the counter has run past the end of the network.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Allocator of client tunnel addresses
#[derive(Debug)]
pub struct AddressPool {
    /// Tunnel network
    network: Ipv4Net,
    /// Server's own address (first host)
    server_address: Ipv4Addr,
    /// Next never-used address
    next: u32,
    /// Last assignable address (before broadcast)
    last: u32,
    /// Addresses returned by removed sessions, oldest first
    released: VecDeque<Ipv4Addr>,
}

impl AddressPool {
    /// Create a pool over `network`. The network needs at least two host
    /// addresses.
    pub fn new(network: Ipv4Net) -> Self {
        let network = network.trunc();
        let base: u32 = network.network().into();
        let broadcast: u32 = network.broadcast().into();

        Self {
            network,
            server_address: Ipv4Addr::from(base + 1),
            next: base + 2,
            last: broadcast.saturating_sub(1),
            released: VecDeque::new(),
        }
    }

    /// Server's tunnel address, with the network's prefix
    pub fn server_address(&self) -> Ipv4Net {
        Ipv4Net::new(self.server_address, self.network.prefix_len()).unwrap_or(self.network)
    }

    /// Take the next free client address
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        if self.next <= self.last {
            let addr = Ipv4Addr::from(self.next);
            self.next += 1;
            return Some(addr);
        }
        self.released.pop_front()
    }

    /// Return an address to the pool
    pub fn release(&mut self, addr: Ipv4Addr) {
        if self.network.contains(&addr) && addr != self.server_address && !self.released.contains(&addr) {
            self.released.push_back(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut pool = AddressPool::new("10.9.0.0/24".parse().unwrap());

        assert_eq!(pool.server_address().to_string(), "10.9.0.1/24");
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 3)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 4)));
    }

    #[test]
    fn test_released_reused_only_after_exhaustion() {
        // /29: server .1, clients .2 through .6
        let mut pool = AddressPool::new("10.9.0.0/29".parse().unwrap());

        let first = pool.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 9, 0, 2));
        pool.release(first);

        // Counter continues rather than reusing .2
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 3)));
        for expected in 4..=6 {
            assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, expected)));
        }

        // Exhausted: only the released address is left
        assert_eq!(pool.allocate(), Some(first));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_release_ignores_foreign_and_duplicate() {
        let mut pool = AddressPool::new("10.9.0.0/30".parse().unwrap());
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(pool.allocate(), None);

        pool.release(Ipv4Addr::new(192, 168, 0, 2));
        pool.release(Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(pool.allocate(), None);

        pool.release(Ipv4Addr::new(10, 9, 0, 2));
        pool.release(Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(pool.allocate(), None);
    }
}
