//! Transport-engine configuration surface (SPEC_FULL.md §10.4 / §6).
//!
//! This is the struct form of exactly the knobs §6 calls out as "exposed
//! as configuration". Parsing it from a file or flags is explicitly out
//! of scope for this crate (§1) — an embedder builds one directly or via
//! [`Config::default`] plus field overrides, the way `ServerContext` in
//! the wider server is built once and shared for the process lifetime.

use std::net::IpAddr;
use std::time::Duration;

/// A single outgoing local address the engine may bind source ports to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingInterface {
    pub addr: IpAddr,
    /// For IPv6 "address privacy": only this many leading bits of `addr`
    /// are fixed; the remaining host bits are randomized per socket.
    pub subnet_prefix_len: Option<u8>,
}

impl OutgoingInterface {
    pub fn new(addr: IpAddr) -> Self {
        OutgoingInterface { addr, subnet_prefix_len: None }
    }

    pub fn with_subnet_prefix(addr: IpAddr, prefix_len: u8) -> Self {
        OutgoingInterface { addr, subnet_prefix_len: Some(prefix_len) }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the fixed outbound TCP/TLS connection pool.
    pub num_tcp: usize,
    /// Maximum number of pooled connections kept in the reuse LRU.
    /// Defaults to `num_tcp` (§6).
    pub tcp_reuse_max: usize,
    /// Number of source ports made available per outgoing UDP interface.
    pub num_ports: usize,
    /// Local addresses the engine may originate UDP/TCP traffic from.
    pub outgoing_interfaces: Vec<OutgoingInterface>,
    /// DSCP value applied to outgoing TCP sockets.
    pub dscp: u8,
    /// Optional TCP_MAXSEG override for outgoing TCP sockets.
    pub tcp_mss: Option<u32>,
    /// Cumulative unwanted-UDP-reply count that triggers the
    /// cache-clearing callback; `None` disables the check.
    pub unwanted_reply_threshold: Option<u64>,
    /// How long to keep a UDP source port open after its timer fires, to
    /// absorb a late reply before the port is recycled.
    pub delayclose: Duration,
    /// Enable 0x20 qname case randomization for spoofing resistance.
    pub use_caps_for_id: bool,
    /// Send SNI on outbound TLS (XoT) connections.
    pub tls_use_sni: bool,
    /// Extra UDP attempts beyond the first before a serviced query gives
    /// up on UDP entirely (`OUTBOUND_UDP_RETRY`).
    pub outbound_udp_retry: u32,
    /// `MAX_PORT_RETRY`: bind attempts before giving up on a source port.
    pub max_port_retry: u32,
    /// `MAX_ID_RETRY`: random-ID attempts before giving up on a UDP send.
    pub max_id_retry: u32,
    /// `MAX_REUSE_TCP_QUERIES`: outstanding-query cap per reused
    /// connection before it's no longer offered for further pipelining.
    pub max_reuse_tcp_queries: usize,
    /// Idle keepalive applied to a reused connection that is not
    /// currently writing or awaiting a reply (`REUSE_TIMEOUT`).
    pub reuse_timeout: Duration,
    /// Default TCP connect/write timeout absent a higher RTT estimate
    /// (`TCP_AUTH_QUERY_TIMEOUT`).
    pub tcp_auth_query_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let num_tcp = 10;
        Config {
            num_tcp,
            tcp_reuse_max: num_tcp,
            num_ports: 64,
            outgoing_interfaces: Vec::new(),
            dscp: 0,
            tcp_mss: None,
            unwanted_reply_threshold: None,
            delayclose: Duration::from_millis(0),
            use_caps_for_id: false,
            tls_use_sni: true,
            outbound_udp_retry: 1,
            max_port_retry: 10_000,
            max_id_retry: 1_000,
            max_reuse_tcp_queries: 200,
            reuse_timeout: Duration::from_secs(60),
            tcp_auth_query_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_reuse_max_defaults_to_num_tcp() {
        let config = Config::default();
        assert_eq!(config.tcp_reuse_max, config.num_tcp);
    }
}
