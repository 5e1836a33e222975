//! Optional dnstap-shaped telemetry hook (§6). The engine emits events to
//! whatever sink is configured; wiring that sink up to a real dnstap
//! frame stream (fstrm-encoded protobuf) is left to the embedder — this
//! crate only defines the call-shape and a no-op default.

use std::net::SocketAddr;
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct OutboundQueryEvent {
    pub peer: SocketAddr,
    pub zone: Option<String>,
    pub query: Vec<u8>,
    pub send_time: SystemTime,
}

#[derive(Debug, Clone)]
pub struct OutboundResponseEvent {
    pub peer: SocketAddr,
    pub zone: Option<String>,
    pub response: Vec<u8>,
    pub recv_time: SystemTime,
}

pub trait DnstapSink: Send {
    fn log_outbound_query(&self, _event: &OutboundQueryEvent) {}
    fn log_outbound_response(&self, _event: &OutboundResponseEvent) {}
}

/// Default sink used when no telemetry collector is configured.
pub struct NullDnstapSink;

impl DnstapSink for NullDnstapSink {}
