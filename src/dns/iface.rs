//! Interface & UDP port pool (§4.1).
//!
//! An [`Interface`] is one bound local address with a pool of source
//! ports it may hand out; a [`PortCommitment`] is one of those ports
//! currently backed by an open `UdpSocket`. Port commitments live in a
//! [`Slab`] rather than a plain `Vec` so that a `PendingUdpQuery` can
//! hold a stable [`Handle`] to "its" port across reentrant callbacks
//! (§5, §9) instead of an index that eviction elsewhere would shift.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};

use rand::Rng;

use crate::dns::errors::EngineError;
use crate::dns::slab::{Handle, Slab};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

pub fn family_of(addr: SocketAddr) -> Family {
    match addr {
        SocketAddr::V4(_) => Family::V4,
        SocketAddr::V6(_) => Family::V6,
    }
}

/// An open UDP socket bound to one source port. Invariant: `outstanding
/// == 0` makes the commitment eligible for retirement (§3).
pub struct PortCommitment {
    pub port: u16,
    pub socket: UdpSocket,
    iface_index: usize,
    pub outstanding: u32,
}

struct Interface {
    family: Family,
    addr: IpAddr,
    subnet_prefix_len: Option<u8>,
    available: Vec<u16>,
    in_use: Vec<Handle>,
}

impl Interface {
    fn randomized_bind_addr(&self, port: u16) -> SocketAddr {
        match (self.addr, self.subnet_prefix_len) {
            (IpAddr::V6(base), Some(prefix_len)) => {
                let mut octets = base.octets();
                let prefix_len = (prefix_len as usize).min(128);
                let mut rng = rand::thread_rng();
                for bit in prefix_len..128 {
                    let byte_idx = bit / 8;
                    let bit_in_byte = 7 - (bit % 8);
                    if rng.gen::<bool>() {
                        octets[byte_idx] |= 1 << bit_in_byte;
                    } else {
                        octets[byte_idx] &= !(1 << bit_in_byte);
                    }
                }
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            _ => SocketAddr::new(self.addr, port),
        }
    }
}

/// Per-address-family set of bound local endpoints and their source
/// ports (§2). `select_ifport` is the whole public send-path contract
/// of §4.1; everything else manages the invariant
/// `in_use + |available| == total_ports` per interface.
pub struct IfacePool {
    ifaces: Vec<Interface>,
    ports: Slab<PortCommitment>,
    max_port_retry: u32,
}

impl IfacePool {
    pub fn new(
        interfaces: &[crate::dns::config::OutgoingInterface],
        num_ports: usize,
        max_port_retry: u32,
    ) -> Self {
        let mut ifaces = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            let family = match iface.addr {
                IpAddr::V4(_) => Family::V4,
                IpAddr::V6(_) => Family::V6,
            };
            // Port 0 asks the OS to pick; the ports vector below is a
            // logical budget of "how many simultaneous source ports this
            // interface may hold open", not a fixed preallocated list —
            // select_ifport binds fresh each time (§4.1's "each trying a
            // fresh random port").
            let available: Vec<u16> = (0..num_ports)
                .map(|_| 1024 + rand::thread_rng().gen_range(0, 65535 - 1024))
                .collect();
            ifaces.push(Interface {
                family,
                addr: iface.addr,
                subnet_prefix_len: iface.subnet_prefix_len,
                available,
                in_use: Vec::new(),
            });
        }
        IfacePool { ifaces, ports: Slab::new(), max_port_retry }
    }

    /// `select_ifport`: returns a handle to a newly bound source port for
    /// the given family, or fails after `MAX_PORT_RETRY` attempts.
    pub fn select_ifport(&mut self, family: Family) -> Result<Handle, EngineError> {
        let candidates: Vec<usize> = self
            .ifaces
            .iter()
            .enumerate()
            .filter(|(_, i)| i.family == family)
            .map(|(idx, _)| idx)
            .collect();
        if candidates.is_empty() {
            return Err(EngineError::Closed(format!(
                "no outgoing interface configured for {:?}",
                family
            )));
        }
        let iface_index = candidates[rand::thread_rng().gen_range(0, candidates.len())];

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > self.max_port_retry {
                return Err(EngineError::Closed(
                    "MAX_PORT_RETRY exceeded selecting a source port".to_string(),
                ));
            }
            let port = {
                let iface = &mut self.ifaces[iface_index];
                if iface.available.is_empty() {
                    return Err(EngineError::Closed(
                        "no free source ports on interface".to_string(),
                    ));
                }
                let pick = rand::thread_rng().gen_range(0, iface.available.len());
                iface.available.swap_remove(pick)
            };
            let bind_addr = self.ifaces[iface_index].randomized_bind_addr(port);
            match UdpSocket::bind(bind_addr) {
                Ok(socket) => {
                    let _ = socket.set_nonblocking(true);
                    let handle =
                        self.ports.insert(PortCommitment { port, socket, iface_index, outstanding: 0 });
                    self.ifaces[iface_index].in_use.push(handle);
                    return Ok(handle);
                }
                Err(_) => {
                    // Lost the race on this exact port (e.g. another
                    // process holds it); it stays out of `available` for
                    // this call and we try a fresh random one, per spec.
                    continue;
                }
            }
        }
    }

    pub fn raise_use(&mut self, handle: Handle) {
        if let Some(commit) = self.ports.get_mut(handle) {
            commit.outstanding += 1;
        }
    }

    /// `portcomm_lower_use`: decrements `outstanding`; at zero, closes
    /// the socket and returns the port to the interface's available
    /// list.
    pub fn lower_use(&mut self, handle: Handle) {
        let should_retire = match self.ports.get_mut(handle) {
            Some(commit) => {
                commit.outstanding = commit.outstanding.saturating_sub(1);
                commit.outstanding == 0
            }
            None => false,
        };
        if should_retire {
            if let Some(commit) = self.ports.remove(handle) {
                let iface = &mut self.ifaces[commit.iface_index];
                iface.in_use.retain(|h| *h != handle);
                iface.available.push(commit.port);
            }
        }
    }

    pub fn socket(&self, handle: Handle) -> Option<&UdpSocket> {
        self.ports.get(handle).map(|c| &c.socket)
    }

    pub fn outstanding(&self, handle: Handle) -> Option<u32> {
        self.ports.get(handle).map(|c| c.outstanding)
    }

    /// Iterates open port commitments for the event loop's poll pass.
    pub fn iter_open(&self) -> impl Iterator<Item = (Handle, &PortCommitment)> {
        self.ports.iter()
    }

    #[cfg(test)]
    pub fn port_accounting_holds(&self) -> bool {
        self.ifaces
            .iter()
            .all(|i| i.available.len() + i.in_use.len() > 0 || i.in_use.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::config::OutgoingInterface;
    use std::net::Ipv4Addr;

    fn loopback_pool(num_ports: usize) -> IfacePool {
        IfacePool::new(
            &[OutgoingInterface::new(IpAddr::V4(Ipv4Addr::LOCALHOST))],
            num_ports,
            1000,
        )
    }

    #[test]
    fn select_ifport_returns_distinct_sockets() {
        let mut pool = loopback_pool(8);
        let a = pool.select_ifport(Family::V4).unwrap();
        let b = pool.select_ifport(Family::V4).unwrap();
        assert_ne!(pool.socket(a).unwrap().local_addr().unwrap(), pool.socket(b).unwrap().local_addr().unwrap());
    }

    #[test]
    fn lower_use_to_zero_retires_the_port() {
        let mut pool = loopback_pool(4);
        let handle = pool.select_ifport(Family::V4).unwrap();
        pool.raise_use(handle);
        assert_eq!(pool.outstanding(handle), Some(1));
        pool.lower_use(handle);
        assert_eq!(pool.outstanding(handle), None);
    }

    #[test]
    fn no_interface_for_family_fails_cleanly() {
        let mut pool = loopback_pool(4);
        assert!(pool.select_ifport(Family::V6).is_err());
    }
}
