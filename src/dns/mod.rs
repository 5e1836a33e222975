//! Outbound resolver network engine
//!
//! Bottom-up: [`iface`] and [`udp`] own source ports and the pending-UDP
//! registry; [`tcp`] owns the outbound TCP/TLS pool and its reuse cache;
//! [`engine`] is the serviced-query layer on top — dedup, the
//! EDNS/TCP-fallback state machine, and callback dispatch. [`wire`] is
//! the narrow byte-oriented DNS helper surface the transport needs;
//! [`infra`] and [`event_loop`] are the external collaborators (RTT/EDNS
//! history, timers and socket readiness) this crate defines trait
//! boundaries for. [`config`], [`errors`], [`logging`], [`metrics`], and
//! [`dnstap`] are the ambient production stack carried alongside it.
//! [`http`] is a narrow auxiliary-transport helper, unrelated to DNS
//! resolution itself.

/// Engine-wide configuration surface and its defaults
pub mod config;

/// Optional dnstap-shaped telemetry hook
pub mod dnstap;

/// Typed error hierarchy for DNS/transport operations
pub mod errors;

/// Serviced-query dedup layer and EDNS/TCP fallback state machine
pub mod engine;

/// Minimal HTTP/1.1 request construction for auxiliary fetches (e.g.
/// trust-anchor downloads) over a comm-point
pub mod http;

/// Event-loop collaborator: one-shot timers and comm-point readiness
pub mod event_loop;

/// Interface & UDP source-port pool
pub mod iface;

/// Infrastructure-cache collaborator: per-peer RTT and EDNS capability
pub mod infra;

/// Structured logging
pub mod logging;

/// Prometheus metrics surface
pub mod metrics;

/// DNS query type codes
pub mod query_type;

/// Generational slab arena used for every handle-addressed pool
pub mod slab;

/// TCP/TLS connection pool and reuse cache
pub mod tcp;

/// Pending-UDP registry and UDP send/receive path
pub mod udp;

/// Narrow DNS wire-format helpers (header, ID, qname case, EDNS OPT)
pub mod wire;
