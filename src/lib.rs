//! Atlas outbound resolver network engine
//!
//! The transport subsystem of a recursive DNS resolver: outbound UDP
//! socket/port management, a reusable outbound TCP/TLS connection pool
//! with query pipelining, request/response matching by transaction ID,
//! timeouts and retries, EDNS capability probing with fallback, and a
//! deduplication layer that coalesces concurrent identical queries into
//! one wire transaction.
//!
//! Resolution logic, answer caching, and DNSSEC validation are not part
//! of this crate — it is purely the wire underneath a resolver.

/// Outbound DNS transport engine and its collaborators
pub mod dns;
