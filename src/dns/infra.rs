//! The infrastructure cache collaborator (§1, §4.6): per-destination RTT
//! history and EDNS capability/lameness. This crate defines the trait
//! boundary and ships one in-memory reference implementation; a resolver
//! embedding this engine is expected to supply its own backed by
//! whatever persistence it already has.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub trait InfraCache: Send {
    /// Whether the peer is currently believed to support EDNS. Optimistic
    /// by default: a peer that has never been probed is assumed capable,
    /// matching the `initial -> UdpEdns` transition of §4.5.
    fn supports_edns(&mut self, addr: SocketAddr) -> bool;

    /// Record that a peer is (or is no longer) known to be EDNS-lame.
    fn set_edns_lame(&mut self, addr: SocketAddr, lame: bool);

    /// Push one RTT sample in milliseconds, or `None` for a timeout
    /// (§4.6: "Every measurement (or -1 on timeout) is pushed").
    fn rtt_update(&mut self, addr: SocketAddr, rtt_ms: Option<i64>);

    /// Best current RTT estimate for a peer, if any samples exist.
    fn rtt_estimate(&self, addr: SocketAddr) -> Option<Duration>;
}

#[derive(Debug, Clone, Default)]
struct HostInfo {
    edns_lame: bool,
    rtt_samples: Vec<i64>,
    timeouts: u32,
    last_update: Option<Instant>,
}

impl HostInfo {
    fn record(&mut self, rtt_ms: Option<i64>) {
        match rtt_ms {
            Some(ms) => self.rtt_samples.push(ms),
            None => self.timeouts += 1,
        }
        if self.rtt_samples.len() > 8 {
            self.rtt_samples.remove(0);
        }
        self.last_update = Some(Instant::now());
    }
}

/// Simple in-memory reference implementation: no persistence, no
/// backoff decay over time, just enough bookkeeping to drive the state
/// machine and RTT accounting described in §4.5/§4.6 in tests.
#[derive(Default)]
pub struct InMemoryInfraCache {
    hosts: HashMap<SocketAddr, HostInfo>,
}

impl InMemoryInfraCache {
    pub fn new() -> Self {
        InMemoryInfraCache { hosts: HashMap::new() }
    }
}

impl InfraCache for InMemoryInfraCache {
    fn supports_edns(&mut self, addr: SocketAddr) -> bool {
        !self.hosts.get(&addr).map(|h| h.edns_lame).unwrap_or(false)
    }

    fn set_edns_lame(&mut self, addr: SocketAddr, lame: bool) {
        self.hosts.entry(addr).or_default().edns_lame = lame;
    }

    fn rtt_update(&mut self, addr: SocketAddr, rtt_ms: Option<i64>) {
        self.hosts.entry(addr).or_default().record(rtt_ms);
    }

    fn rtt_estimate(&self, addr: SocketAddr) -> Option<Duration> {
        let host = self.hosts.get(&addr)?;
        if host.rtt_samples.is_empty() {
            return None;
        }
        let sum: i64 = host.rtt_samples.iter().sum();
        let avg = sum / host.rtt_samples.len() as i64;
        Some(Duration::from_millis(avg.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53)
    }

    #[test]
    fn unprobed_peer_is_assumed_edns_capable() {
        let mut infra = InMemoryInfraCache::new();
        assert!(infra.supports_edns(addr()));
    }

    #[test]
    fn edns_lame_flag_is_sticky_until_cleared() {
        let mut infra = InMemoryInfraCache::new();
        infra.set_edns_lame(addr(), true);
        assert!(!infra.supports_edns(addr()));
        infra.set_edns_lame(addr(), false);
        assert!(infra.supports_edns(addr()));
    }

    #[test]
    fn rtt_estimate_averages_samples() {
        let mut infra = InMemoryInfraCache::new();
        infra.rtt_update(addr(), Some(100));
        infra.rtt_update(addr(), Some(200));
        assert_eq!(infra.rtt_estimate(addr()), Some(Duration::from_millis(150)));
    }
}
