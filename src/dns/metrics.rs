//! Prometheus metrics for the outbound transport (SPEC_FULL.md §10.3).
//!
//! Scoped to exactly what an outbound transport can honestly report:
//! queries sent per transport, replies received, timeouts, unwanted
//! replies, retries, EDNS fallbacks, reuse-cache hit/evict counts, and an
//! RTT histogram. The teacher's `metrics.rs` additionally carries
//! answer-cache, zone, DNSSEC, web-request, and session metrics that
//! have no counterpart in a transport-only crate; those are dropped
//! (noted in DESIGN.md) rather than carried as dead exports.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    /// Queries sent, by transport (`udp`, `tcp`, `tls`).
    pub static ref QUERIES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_queries_sent_total",
        "Outbound queries sent, by transport",
        &["transport"]
    ).unwrap();

    /// Replies received, by transport.
    pub static ref REPLIES_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_replies_received_total",
        "Replies received from upstream, by transport",
        &["transport"]
    ).unwrap();

    /// Per-query timeouts, by transport.
    pub static ref TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_timeouts_total",
        "Query timeouts, by transport",
        &["transport"]
    ).unwrap();

    /// UDP replies that matched no pending query (§4.2).
    pub static ref UNWANTED_REPLIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_unwanted_replies_total",
        "UDP replies that matched no pending query",
        &["reason"]
    ).unwrap();

    /// UDP resends issued by the serviced-query retry counter (§4.5).
    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_retries_total",
        "Query resends issued by the retry/fallback state machine",
        &["reason"]
    ).unwrap();

    /// EDNS fallback transitions, by direction (into/out of fallback).
    pub static ref EDNS_FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_edns_fallbacks_total",
        "EDNS/TCP fallback state transitions",
        &["transition"]
    ).unwrap();

    /// TCP reuse-cache hits and evictions.
    pub static ref REUSE_CACHE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outnet_reuse_cache_total",
        "TCP reuse-cache hit/miss/eviction events",
        &["event"]
    ).unwrap();

    /// Round-trip time, by transport, in seconds.
    pub static ref RTT_SECONDS: HistogramVec = register_histogram_vec!(
        "outnet_rtt_seconds",
        "Observed round-trip time per completed query, by transport",
        &["transport"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accept_labels_without_panicking() {
        QUERIES_SENT_TOTAL.with_label_values(&["udp"]).inc();
        REPLIES_RECEIVED_TOTAL.with_label_values(&["udp"]).inc();
        TIMEOUTS_TOTAL.with_label_values(&["udp"]).inc();
        UNWANTED_REPLIES_TOTAL.with_label_values(&["id_mismatch"]).inc();
        RETRIES_TOTAL.with_label_values(&["udp_timeout"]).inc();
        EDNS_FALLBACKS_TOTAL.with_label_values(&["udp_edns_to_fallback"]).inc();
        REUSE_CACHE_TOTAL.with_label_values(&["hit"]).inc();
        RTT_SECONDS.with_label_values(&["udp"]).observe(0.01);

        let families = prometheus::gather();
        assert!(families.iter().any(|f| f.get_name() == "outnet_queries_sent_total"));
        assert!(families.iter().any(|f| f.get_name() == "outnet_rtt_seconds"));
    }
}
