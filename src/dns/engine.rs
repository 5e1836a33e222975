//! Serviced-query dedup layer and EDNS/TCP fallback state machine (§4.5,
//! §5, §7), built on top of [`crate::dns::udp::UdpEngine`] and
//! [`crate::dns::tcp::TcpEngine`].
//!
//! [`Engine`] is the single entry point an embedder drives: [`Engine::submit`]
//! enqueues a query (coalescing it into an identical in-flight one if §9's
//! dedup invariant applies) and [`Engine::tick`] is called once per
//! event-loop turn to poll sockets, dispatch fired timers, and deliver
//! finished queries to their callbacks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use rand::thread_rng;

use crate::dns::config::Config;
use crate::dns::dnstap::{DnstapSink, OutboundQueryEvent, OutboundResponseEvent};
use crate::dns::errors::EngineError;
use crate::dns::event_loop::EventLoop;
use crate::dns::iface::IfacePool;
use crate::dns::infra::InfraCache;
use crate::dns::logging::{CorrelationContext, DnsQueryLog, LoggerConfig, StructuredLogger};
use crate::dns::metrics::{
    EDNS_FALLBACKS_TOTAL, QUERIES_SENT_TOTAL, REPLIES_RECEIVED_TOTAL, RETRIES_TOTAL, RTT_SECONDS,
    TIMEOUTS_TOTAL,
};
use crate::dns::query_type::QueryType;
use crate::dns::slab::{Handle, Slab};
use crate::dns::tcp::{self, TcpEngine};
use crate::dns::udp::{self, UdpEngine};
use crate::dns::wire;

/// DO bit of the requested DNSSEC handling, carried alongside CD rather
/// than inside [`wire`]'s EDNS helpers since it also participates in the
/// dedup key (§9: two queries differing only in DO are distinct).
pub const DNSSEC_DO: u8 = 0x01;
/// CD bit, set on the outgoing query when the asker wants checking disabled.
pub const DNSSEC_CD: u8 = 0x02;

/// Default RTT belief (ms) for a peer the infra cache has no samples for
/// yet — ported from the upstream resolver's own "unknown server" default
/// rather than treating an unprobed host as either instantly-fast or
/// unreachable.
const UNKNOWN_SERVER_NICENESS_MS: i64 = 376;

/// Per-query progress through the EDNS/TCP fallback state machine (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Initial,
    Udp,
    UdpEdns,
    UdpEdnsFrag,
    UdpEdnsFallback,
    Tcp,
    TcpEdns,
    TcpEdnsFallback,
}

impl Status {
    /// Whether the *current* attempt should carry an EDNS OPT. Notably
    /// false for the `*Fallback` states: those exist specifically to
    /// resend the query *without* EDNS, to test whether EDNS itself was
    /// the problem.
    fn sends_edns(self) -> bool {
        matches!(self, Status::UdpEdns | Status::UdpEdnsFrag | Status::TcpEdns)
    }

    /// Whether a TC-bit escalation from this (UDP-side) status should
    /// target `TcpEdns` rather than plain `Tcp` — true for every UDP EDNS
    /// state including the fallback-without-EDNS probe, since the probe
    /// is itself still part of an EDNS negotiation in progress.
    fn escalates_to_tcp_edns(self) -> bool {
        matches!(self, Status::UdpEdns | Status::UdpEdnsFrag | Status::UdpEdnsFallback)
    }
}

/// Identifies a query eligible for dedup (§9, P6): at most one in-flight
/// serviced entry exists per distinct key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServicedKey {
    qname_lower: Vec<u8>,
    qtype: QueryType,
    qclass: u16,
    dnssec: u8,
    remote: SocketAddr,
    edns_opts: Vec<u8>,
}

/// What the caller asks the engine to resolve. `base_packet` is a
/// complete, well-formed query (question section plus any caller-supplied
/// EDNS/OPT already attached where the caller wants one unconditionally);
/// the engine's own EDNS attach/detach dance in [`Engine::encode`] only
/// concerns the *probed* EDNS behavior of §4.5 and overwrites the
/// transaction ID on every send.
pub struct QuerySpec {
    pub base_packet: Vec<u8>,
    pub qtype: QueryType,
    pub qclass: u16,
    pub remote: SocketAddr,
    pub dnssec: u8,
    /// Whether DNSSEC validation is required for this query; gates
    /// whether a successful EDNS fallback marks the peer EDNS-lame
    /// (§4.5: a validator must keep asking with EDNS to get RRSIGs).
    pub dnssec_required: bool,
    /// Extra EDNS option bytes participating in the dedup key (§9).
    pub edns_opts: Vec<u8>,
    /// Skip 0x20 case randomization and the bitwise qname check on reply
    /// for this query even if `use_caps_for_id` is enabled globally.
    pub nocaps: bool,
    pub zone: Option<String>,
    pub timeout: Duration,
    /// Force TCP (or TLS, below) from the first send rather than trying
    /// UDP first (§4.3's `tcp_upstream`/`ssl_upstream` forced modes).
    pub tcp_upstream: bool,
    pub tls_upstream: bool,
    pub tls_auth_name: Option<String>,
}

/// The four outcomes a serviced query can deliver to a registered
/// callback (§7).
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Reply(Vec<u8>),
    Timeout,
    Closed(String),
    CapsFail,
}

fn error_outcome(err: EngineError) -> QueryOutcome {
    match err {
        EngineError::Timeout => QueryOutcome::Timeout,
        EngineError::Closed(reason) => QueryOutcome::Closed(reason),
        EngineError::CapsFail => QueryOutcome::CapsFail,
        EngineError::Io(reason) => QueryOutcome::Closed(reason),
    }
}

pub type ServiceCallback = Box<dyn FnMut(QueryOutcome) + Send>;

struct ServicedEntry {
    key: ServicedKey,
    base_packet: Vec<u8>,
    dnssec: u8,
    dnssec_required: bool,
    nocaps: bool,
    qtype: QueryType,
    remote: SocketAddr,
    tls: bool,
    tls_auth_name: Option<String>,
    /// Whether the caller forced TCP/TLS from the first send, as opposed
    /// to arriving at TCP via a TC-bit escalation from UDP. RTT samples
    /// on a TCP reply are only pushed to the infra cache in the forced
    /// case (§4.6 — the source only measures TCP round-trip when TCP
    /// *is* the resolver's chosen transport, not an incidental retry).
    forced_tcp: bool,
    zone: Option<String>,
    status: Status,
    /// UDP attempts beyond the first already made at the current rtt
    /// bucket; compared against `config.outbound_udp_retry` (§9 open
    /// question — see `on_udp_timeout` doc comment).
    retry: u32,
    /// Last measured RTT in ms, or -1 if none yet (mirrors the source's
    /// sentinel rather than `Option<i64>`, since it is itself compared
    /// against a threshold rather than just displayed).
    last_rtt: i64,
    last_sent: std::time::Instant,
    timeout: Duration,
    /// Raw (case-preserved) qname bytes as actually transmitted, stashed
    /// by `encode` for the bitwise caps check at final delivery.
    sent_qname: Vec<u8>,
    callbacks: Vec<(u64, ServiceCallback)>,
    next_cb_id: u64,
}

/// The serviced-query layer: owns a [`UdpEngine`] and a [`TcpEngine`] and
/// drives the EDNS/TCP fallback state machine and callback dedup on top
/// of them. One `Engine` is built per process and shared by every caller
/// that wants to resolve an outbound query (§1).
pub struct Engine {
    config: Config,
    udp: UdpEngine,
    tcp: TcpEngine,
    infra: Box<dyn InfraCache>,
    dnstap: Box<dyn DnstapSink>,
    logger: StructuredLogger,
    serviced: Slab<ServicedEntry>,
    index: HashMap<ServicedKey, Handle>,
    /// Timers armed by `delayclose` (§4.2), mapping the delay timer back
    /// to the port it will eventually release.
    delayclose: HashMap<Handle, Handle>,
    /// Set by `begin_shutdown`; stops draining the UDP/TCP wait queues so
    /// no new wire traffic is originated while in-flight queries finish
    /// out or time out naturally (§5).
    want_to_quit: bool,
}

impl Engine {
    pub fn new(config: Config, infra: Box<dyn InfraCache>, dnstap: Box<dyn DnstapSink>) -> Self {
        let ifaces = IfacePool::new(&config.outgoing_interfaces, config.num_ports, config.max_port_retry);
        let udp = UdpEngine::new(ifaces, config.max_id_retry, config.unwanted_reply_threshold);
        let outgoing_addrs = config.outgoing_interfaces.iter().map(|i| i.addr).collect();
        let tcp = TcpEngine::with_interfaces(
            config.num_tcp,
            config.tcp_reuse_max,
            config.max_reuse_tcp_queries,
            config.dscp,
            config.tcp_mss,
            config.tls_use_sni,
            config.tcp_auth_query_timeout,
            outgoing_addrs,
        );
        let logger = StructuredLogger::init(LoggerConfig::default()).expect("logger init never fails");
        Engine {
            config,
            udp,
            tcp,
            infra,
            dnstap,
            logger,
            serviced: Slab::new(),
            index: HashMap::new(),
            delayclose: HashMap::new(),
            want_to_quit: false,
        }
    }

    pub fn begin_shutdown(&mut self) {
        self.want_to_quit = true;
    }

    pub fn is_idle(&self) -> bool {
        self.serviced.is_empty()
    }

    /// `outnet_serviced_query`: enqueues `spec`. If an identical query is
    /// already in flight (§9, P6) `callback` is appended to it instead of
    /// issuing a new wire transaction; otherwise a new serviced entry is
    /// created and its first send is kicked off immediately.
    pub fn submit(
        &mut self,
        spec: QuerySpec,
        event_loop: &mut dyn EventLoop,
        callback: ServiceCallback,
    ) -> Handle {
        let qname_lower = wire::extract_qname_lower(&spec.base_packet).unwrap_or_default();
        let key = ServicedKey {
            qname_lower,
            qtype: spec.qtype,
            qclass: spec.qclass,
            dnssec: spec.dnssec,
            remote: spec.remote,
            edns_opts: spec.edns_opts,
        };

        if let Some(&handle) = self.index.get(&key) {
            if let Some(entry) = self.serviced.get_mut(handle) {
                let id = entry.next_cb_id;
                entry.next_cb_id += 1;
                entry.callbacks.push((id, callback));
                return handle;
            }
        }

        let force_tcp = spec.tcp_upstream || spec.tls_upstream;
        let entry = ServicedEntry {
            key: key.clone(),
            base_packet: spec.base_packet,
            dnssec: spec.dnssec,
            dnssec_required: spec.dnssec_required,
            nocaps: spec.nocaps,
            qtype: spec.qtype,
            remote: spec.remote,
            tls: spec.tls_upstream,
            tls_auth_name: spec.tls_auth_name,
            forced_tcp: force_tcp,
            zone: spec.zone,
            status: Status::Initial,
            retry: 0,
            last_rtt: -1,
            last_sent: event_loop.now(),
            timeout: spec.timeout,
            sent_qname: Vec::new(),
            callbacks: vec![(0, callback)],
            next_cb_id: 1,
        };
        let handle = self.serviced.insert(entry);
        self.index.insert(key, handle);

        if let Some(e) = self.serviced.get(handle) {
            self.dnstap.log_outbound_query(&OutboundQueryEvent {
                peer: e.remote,
                zone: e.zone.clone(),
                query: e.base_packet.clone(),
                send_time: SystemTime::now(),
            });
        }

        self.start(handle, force_tcp, event_loop);
        handle
    }

    /// `outnet_serviced_query_stop`: removes one callback by the id
    /// returned from its registration slot. If the callback list becomes
    /// empty and the entry isn't already mid-dispatch, it's silently torn
    /// down (no callback invoked) — the underlying UDP/TCP transport is
    /// left to finish or time out on its own and is dropped as soon as it
    /// reports back to an owner the index no longer recognizes.
    pub fn stop(&mut self, handle: Handle, callback_id: u64) {
        let now_empty = match self.serviced.get_mut(handle) {
            Some(entry) => {
                entry.callbacks.retain(|(id, _)| *id != callback_id);
                entry.callbacks.is_empty()
            }
            None => return,
        };
        if now_empty {
            if let Some(entry) = self.serviced.remove(handle) {
                self.index.remove(&entry.key);
            }
        }
    }

    /// `outnet_tcp_take_into_use` equivalent, taking a still-Initial
    /// entry through its first send: forced TCP/TLS if `force_tcp`,
    /// otherwise UDP, each with or without EDNS per the infra cache's
    /// current belief about the peer (§4.5's `initial -> Udp[Edns]`
    /// transition).
    fn start(&mut self, handle: Handle, force_tcp: bool, event_loop: &mut dyn EventLoop) {
        let remote = match self.serviced.get(handle) {
            Some(e) => e.remote,
            None => return,
        };
        let supports_edns = self.infra.supports_edns(remote);
        if let Some(e) = self.serviced.get_mut(handle) {
            e.status = match (force_tcp, supports_edns) {
                (true, true) => Status::TcpEdns,
                (true, false) => Status::Tcp,
                (false, true) => Status::UdpEdns,
                (false, false) => Status::Udp,
            };
        }
        if force_tcp {
            self.send_tcp(handle, event_loop);
        } else {
            self.send_udp(handle, event_loop);
        }
    }

    /// Builds the wire bytes for `handle`'s current attempt: 0x20 case
    /// randomization if enabled, EDNS OPT if the current status calls for
    /// one (sized down under `UdpEdnsFrag`), and the CD bit if requested.
    /// Stashes the as-sent qname bytes for the eventual caps check.
    fn encode(&mut self, handle: Handle) -> Vec<u8> {
        let (mut packet, status, dnssec, qtype, remote, use_caps) = {
            let e = match self.serviced.get(handle) {
                Some(e) => e,
                None => return Vec::new(),
            };
            (
                e.base_packet.clone(),
                e.status,
                e.dnssec,
                e.qtype,
                e.remote,
                self.config.use_caps_for_id && !e.nocaps,
            )
        };

        if use_caps && qtype != QueryType::Ptr {
            let mut rng = thread_rng();
            wire::randomize_qname_case(&mut packet, wire::question_qname_offset(), &mut rng);
        }
        let sent_qname = wire::extract_qname_raw(&packet).unwrap_or_default();

        if status.sends_edns() {
            let size = if status == Status::UdpEdnsFrag {
                if remote.is_ipv6() { wire::EDNS_FRAG_SIZE_V6 } else { wire::EDNS_FRAG_SIZE_V4 }
            } else {
                wire::EDNS_ADVERTISED_SIZE
            };
            wire::attach_edns_opt(&mut packet, size, dnssec & DNSSEC_DO != 0);
        }
        if dnssec & DNSSEC_CD != 0 {
            wire::set_cd_bit(&mut packet);
        }

        if let Some(e) = self.serviced.get_mut(handle) {
            e.sent_qname = sent_qname;
        }
        packet
    }

    /// Sends (or resends, after a status change) `handle`'s current
    /// attempt over UDP. A fresh encode happens on every call since the
    /// EDNS size and qname perturbation depend on the current `Status`.
    fn send_udp(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) {
        let (remote, timeout) = match self.serviced.get(handle) {
            Some(e) => (e.remote, e.timeout),
            None => return,
        };
        // `serviced_udp_send` refreshes its rtt belief from the infra
        // cache on every (re)send, not just the first — the UdpEdns ->
        // UdpEdnsFrag decision on a later timeout reads this value.
        let estimate_ms = self
            .infra
            .rtt_estimate(remote)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(UNKNOWN_SERVER_NICENESS_MS);
        if let Some(e) = self.serviced.get_mut(handle) {
            e.last_rtt = estimate_ms;
        }
        let mut packet = self.encode(handle);
        match self.udp.send_udp(handle.to_u64(), remote, &mut packet, timeout, event_loop) {
            udp::SendOutcome::Sent(_) => {
                let now = event_loop.now();
                if let Some(e) = self.serviced.get_mut(handle) {
                    e.last_sent = now;
                }
            }
            udp::SendOutcome::Waiting => {}
            udp::SendOutcome::Failed(err) => self.finish(handle, error_outcome(err)),
        }
    }

    /// Sends (or resends) `handle`'s current attempt over TCP/TLS —
    /// either the first send in a forced-TCP mode, or a TC-bit/EDNS
    /// escalation from UDP, or a FORMERR/NOTIMP fallback within TCP.
    fn send_tcp(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) {
        let (remote, tls, sni, timeout) = match self.serviced.get(handle) {
            Some(e) => (e.remote, e.tls, e.tls_auth_name.clone(), e.timeout),
            None => return,
        };
        let packet = self.encode(handle);
        let (outcome, evicted) =
            self.tcp.send_tcp(handle.to_u64(), remote, tls, sni.as_deref(), packet, timeout, event_loop);
        for owner in evicted {
            self.on_tcp_closed(Handle::from_u64(owner));
        }
        match outcome {
            tcp::SendOutcome::Queued(_) => {
                QUERIES_SENT_TOTAL.with_label_values(&[if tls { "tls" } else { "tcp" }]).inc();
                let now = event_loop.now();
                if let Some(e) = self.serviced.get_mut(handle) {
                    e.last_sent = now;
                }
            }
            tcp::SendOutcome::Waiting => {}
            tcp::SendOutcome::Failed(err) => self.finish(handle, error_outcome(err)),
        }
    }

    /// Polls every open UDP port, the event loop's fired timers, every
    /// open TCP slot, sweeps idle reused TCP connections, and — unless a
    /// shutdown is in progress — drains whatever the UDP/TCP wait queues
    /// can now admit. Call once per event-loop turn.
    pub fn tick(&mut self, event_loop: &mut dyn EventLoop) {
        self.poll_udp(event_loop);
        self.poll_timers(event_loop);
        self.poll_tcp(event_loop);
        self.tcp.sweep_idle(self.config.reuse_timeout, event_loop);
        if !self.want_to_quit {
            self.drain_waiters(event_loop);
        }
    }

    fn poll_udp(&mut self, event_loop: &mut dyn EventLoop) {
        let ports: Vec<Handle> = self.udp.ifaces().iter_open().map(|(h, _)| h).collect();
        for port in ports {
            loop {
                let socket = match self.udp.ifaces().socket(port) {
                    Some(s) => s,
                    None => break,
                };
                let mut buf = [0u8; 65535];
                match socket.recv_from(&mut buf) {
                    Ok((n, peer)) => {
                        let data = buf[..n].to_vec();
                        match self.udp.recv_on(port, data, peer, event_loop) {
                            udp::RecvOutcome::Matched { owner, reply, port: _ } => {
                                self.on_udp_reply(Handle::from_u64(owner), reply, event_loop);
                            }
                            udp::RecvOutcome::Unwanted => {}
                            udp::RecvOutcome::UnwantedThresholdCrossed => {
                                log::warn!("unwanted UDP reply threshold crossed, clearing would-be cache hook");
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
    }

    fn poll_timers(&mut self, event_loop: &mut dyn EventLoop) {
        let fired = event_loop.take_fired();
        for timer in fired {
            if let Some(port) = self.delayclose.remove(&timer) {
                self.udp.release_port_after_delayclose(port);
                event_loop.drop_timer(timer);
                continue;
            }
            if let Some(pending) = self.udp.find_by_timer(timer) {
                if let Some((owner, remote, port)) = self.udp.handle_timeout(pending) {
                    event_loop.drop_timer(timer);
                    self.on_udp_timeout(Handle::from_u64(owner), remote, port, event_loop);
                }
                continue;
            }
            if let Some(fired_tcp) = self.tcp.handle_timer(timer, event_loop) {
                match fired_tcp {
                    tcp::TcpTimerFired::Waiting(owner) | tcp::TcpTimerFired::Query(owner) => {
                        self.on_tcp_timeout(Handle::from_u64(owner));
                    }
                    tcp::TcpTimerFired::Connect(owners) => {
                        for owner in owners {
                            self.on_tcp_timeout(Handle::from_u64(owner));
                        }
                    }
                }
            }
        }
    }

    fn poll_tcp(&mut self, event_loop: &mut dyn EventLoop) {
        for handle in self.tcp.open_handles() {
            let wrote = self.tcp.on_writable(handle, event_loop);
            self.apply_tcp_outcome(wrote, event_loop);
            let read = self.tcp.on_readable(handle, event_loop);
            self.apply_tcp_outcome(read, event_loop);
        }
    }

    fn apply_tcp_outcome(&mut self, outcome: tcp::PollOutcome, event_loop: &mut dyn EventLoop) {
        match outcome {
            tcp::PollOutcome::Reply { owner, data } => {
                self.on_tcp_reply(Handle::from_u64(owner), data, event_loop);
            }
            tcp::PollOutcome::Closed(owners) => {
                for owner in owners {
                    self.on_tcp_closed(Handle::from_u64(owner));
                }
            }
            tcp::PollOutcome::Idle | tcp::PollOutcome::WroteQuery => {}
        }
    }

    fn drain_waiters(&mut self, event_loop: &mut dyn EventLoop) {
        for (owner, outcome) in self.udp.drain_wait_queue(event_loop) {
            let handle = Handle::from_u64(owner);
            match outcome {
                udp::SendOutcome::Sent(_) => {
                    let now = event_loop.now();
                    if let Some(e) = self.serviced.get_mut(handle) {
                        e.last_sent = now;
                    }
                }
                udp::SendOutcome::Waiting => {}
                udp::SendOutcome::Failed(err) => self.finish(handle, error_outcome(err)),
            }
        }
        for (owner, outcome, evicted) in self.tcp.drain_wait_queue(event_loop) {
            for ev_owner in evicted {
                self.on_tcp_closed(Handle::from_u64(ev_owner));
            }
            let handle = Handle::from_u64(owner);
            match outcome {
                tcp::SendOutcome::Queued(_) => {
                    let now = event_loop.now();
                    if let Some(e) = self.serviced.get_mut(handle) {
                        e.last_sent = now;
                    }
                }
                tcp::SendOutcome::Waiting => {}
                tcp::SendOutcome::Failed(err) => self.finish(handle, error_outcome(err)),
            }
        }
    }

    fn record_rtt(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) {
        let (remote, last_sent, status) = match self.serviced.get(handle) {
            Some(e) => (e.remote, e.last_sent, e.status),
            None => return,
        };
        let now = event_loop.now();
        if now <= last_sent {
            return;
        }
        let rtt_ms = now.duration_since(last_sent).as_millis() as i64;
        // §4.6: discard entirely past 60s rather than pushing a sample.
        if rtt_ms < 60_000 {
            self.infra.rtt_update(remote, Some(rtt_ms));
            if let Some(e) = self.serviced.get_mut(handle) {
                e.last_rtt = rtt_ms;
            }
            let transport = if matches!(status, Status::Tcp | Status::TcpEdns | Status::TcpEdnsFallback) {
                "tcp"
            } else {
                "udp"
            };
            RTT_SECONDS.with_label_values(&[transport]).observe(rtt_ms as f64 / 1000.0);
        }
    }

    /// `serviced_udp_callback`'s reply path: EDNS-failure fallback first,
    /// then peer-capability bookkeeping, then RTT, then a TC-triggered
    /// escalation to TCP, and only then final delivery.
    fn on_udp_reply(&mut self, handle: Handle, reply: Vec<u8>, event_loop: &mut dyn EventLoop) {
        if !self.serviced.contains(handle) {
            return;
        }
        if let Some(e) = self.serviced.get(handle) {
            self.dnstap.log_outbound_response(&OutboundResponseEvent {
                peer: e.remote,
                zone: e.zone.clone(),
                response: reply.clone(),
                recv_time: SystemTime::now(),
            });
        }

        REPLIES_RECEIVED_TOTAL.with_label_values(&["udp"]).inc();
        let status = self.serviced.get(handle).unwrap().status;
        let rcode = wire::rcode(&reply);
        let malformed = wire::is_edns_malformed_reply(&reply);

        if matches!(status, Status::UdpEdns | Status::UdpEdnsFrag)
            && (rcode == Some(1) || rcode == Some(4) || malformed)
        {
            EDNS_FALLBACKS_TOTAL.with_label_values(&["udp_edns_to_fallback"]).inc();
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = Status::UdpEdnsFallback;
                e.retry = 0;
            }
            self.send_udp(handle, event_loop);
            return;
        } else if status == Status::UdpEdns {
            let remote = self.serviced.get(handle).unwrap().remote;
            self.infra.set_edns_lame(remote, false);
        } else if status == Status::UdpEdnsFallback && matches!(rcode, Some(0) | Some(3) | Some(6)) {
            let (remote, dnssec_required) = {
                let e = self.serviced.get(handle).unwrap();
                (e.remote, e.dnssec_required)
            };
            if !dnssec_required {
                self.infra.set_edns_lame(remote, true);
            }
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = Status::Udp;
            }
        }

        self.record_rtt(handle, event_loop);

        if wire::has_tc(&reply) {
            let status = self.serviced.get(handle).unwrap().status;
            let new_status = if status.escalates_to_tcp_edns() { Status::TcpEdns } else { Status::Tcp };
            EDNS_FALLBACKS_TOTAL.with_label_values(&["tc_escalate_to_tcp"]).inc();
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = new_status;
            }
            self.send_tcp(handle, event_loop);
            return;
        }

        self.finish(handle, QueryOutcome::Reply(reply));
    }

    /// `serviced_udp_callback`'s timeout path. The `UdpEdns <-> UdpEdnsFrag`
    /// dance (§4.5: drop to a fragmentation-safe EDNS size once, then back
    /// off EDNS size entirely on a second timeout at that size) happens
    /// before the generic retry counter, and does not itself consume a
    /// retry.
    ///
    /// `OUTBOUND_UDP_RETRY` defaults to 1, and the source increments
    /// `retry` *before* comparing it against that bound — so with the
    /// stock configuration, the very first timeout outside the FRAG dance
    /// already fails `1 < 1` and is delivered as a real `Timeout` rather
    /// than resent. That reads like an off-by-one, but it's what the
    /// source does and a caller wanting an actual extra UDP attempt needs
    /// to raise `outbound_udp_retry` above 1; preserved here rather than
    /// "fixed" to the more intuitive reading.
    fn on_udp_timeout(&mut self, handle: Handle, remote: SocketAddr, port: Handle, event_loop: &mut dyn EventLoop) {
        self.release_or_delayclose(port, event_loop);

        if !self.serviced.contains(handle) {
            return;
        }
        TIMEOUTS_TOTAL.with_label_values(&["udp"]).inc();
        let status = self.serviced.get(handle).unwrap().status;
        let last_rtt = self.serviced.get(handle).unwrap().last_rtt;

        if status == Status::UdpEdns && last_rtt < 5000 {
            EDNS_FALLBACKS_TOTAL.with_label_values(&["udp_edns_to_frag"]).inc();
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = Status::UdpEdnsFrag;
            }
            self.send_udp(handle, event_loop);
            return;
        }
        if status == Status::UdpEdnsFrag {
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = Status::UdpEdns;
            }
        }

        self.infra.rtt_update(remote, None);

        let retry = {
            let e = self.serviced.get_mut(handle).unwrap();
            e.retry += 1;
            e.retry
        };
        if retry < self.config.outbound_udp_retry {
            RETRIES_TOTAL.with_label_values(&["udp_timeout"]).inc();
            self.send_udp(handle, event_loop);
            return;
        }

        self.finish(handle, QueryOutcome::Timeout);
    }

    /// §4.2's delayclose knob: if enabled and nothing else is waiting for
    /// a port right now, keep this one open a little longer behind a
    /// fresh timer instead of releasing it immediately, to absorb a
    /// straggling reply without risking ICMP port-unreachable noise on
    /// instant reuse.
    fn release_or_delayclose(&mut self, port: Handle, event_loop: &mut dyn EventLoop) {
        if self.config.delayclose > Duration::from_millis(0) && self.udp.wait_queue_is_empty() {
            let timer = event_loop.create_timer();
            event_loop.arm_timer(timer, self.config.delayclose);
            self.delayclose.insert(timer, port);
        } else {
            self.udp.release_port_after_delayclose(port);
        }
    }

    /// `serviced_tcp_callback`'s reply path: EDNS-failure fallback first,
    /// then peer-capability bookkeeping, then RTT, then final delivery.
    /// TCP replies are not re-checked for TC (the C source doesn't either
    /// — a reply arriving whole over TCP has nowhere further to escalate).
    fn on_tcp_reply(&mut self, handle: Handle, data: Vec<u8>, event_loop: &mut dyn EventLoop) {
        if !self.serviced.contains(handle) {
            return;
        }
        let status = self.serviced.get(handle).unwrap().status;
        let rcode = wire::rcode(&data);
        let tls = self.serviced.get(handle).map(|e| e.tls).unwrap_or(false);
        REPLIES_RECEIVED_TOTAL.with_label_values(&[if tls { "tls" } else { "tcp" }]).inc();

        if status == Status::TcpEdns && matches!(rcode, Some(1) | Some(4)) {
            EDNS_FALLBACKS_TOTAL.with_label_values(&["tcp_edns_to_fallback"]).inc();
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = Status::TcpEdnsFallback;
            }
            self.send_tcp(handle, event_loop);
            return;
        } else if status == Status::TcpEdnsFallback && matches!(rcode, Some(0) | Some(3) | Some(6)) {
            let (remote, dnssec_required) = {
                let e = self.serviced.get(handle).unwrap();
                (e.remote, e.dnssec_required)
            };
            if !dnssec_required {
                self.infra.set_edns_lame(remote, true);
            }
            if let Some(e) = self.serviced.get_mut(handle) {
                e.status = Status::Tcp;
            }
        }

        if self.serviced.get(handle).map(|e| e.forced_tcp).unwrap_or(false) {
            self.record_rtt(handle, event_loop);
        }

        if let Some(e) = self.serviced.get(handle) {
            self.dnstap.log_outbound_response(&OutboundResponseEvent {
                peer: e.remote,
                zone: e.zone.clone(),
                response: data.clone(),
                recv_time: SystemTime::now(),
            });
        }

        self.finish(handle, QueryOutcome::Reply(data));
    }

    fn on_tcp_closed(&mut self, handle: Handle) {
        let (remote, forced_tcp) = match self.serviced.get(handle) {
            Some(e) => (e.remote, e.forced_tcp),
            None => return,
        };
        if forced_tcp {
            self.infra.rtt_update(remote, None);
        }
        self.finish(handle, QueryOutcome::Closed("tcp connection closed".to_string()));
    }

    /// A TCP timer (a wait-listed query never getting a slot, a
    /// write/connect stall, or an awaiting-reply query) fired before a
    /// reply arrived. Delivered as `Timeout` rather than `Closed` since
    /// nothing about the transport was observed to fail (§7).
    fn on_tcp_timeout(&mut self, handle: Handle) {
        let (remote, forced_tcp, tls) = match self.serviced.get(handle) {
            Some(e) => (e.remote, e.forced_tcp, e.tls),
            None => return,
        };
        if forced_tcp {
            self.infra.rtt_update(remote, None);
        }
        TIMEOUTS_TOTAL.with_label_values(&[if tls { "tls" } else { "tcp" }]).inc();
        self.finish(handle, QueryOutcome::Timeout);
    }

    /// `serviced_callbacks`: removes the entry from the dedup index
    /// *before* invoking any callback, so a reentrant callback that
    /// submits an identical query registers a fresh entry rather than
    /// being folded back into this one (§5). The bitwise 0x20 caps check
    /// (§4.5) is applied here, at final delivery, and nowhere else —
    /// intermediate fallback/retry replies are never caps-checked.
    fn finish(&mut self, handle: Handle, outcome: QueryOutcome) {
        let mut entry = match self.serviced.remove(handle) {
            Some(e) => e,
            None => return,
        };
        self.index.remove(&entry.key);

        let outcome = match outcome {
            QueryOutcome::Reply(reply) => self.check_caps(&entry, reply),
            other => other,
        };

        let ctx = CorrelationContext::new("outnet", "resolve_query");
        let transport = match entry.status {
            Status::Tcp | Status::TcpEdns | Status::TcpEdnsFallback => {
                if entry.tls { "tls" } else { "tcp" }
            }
            _ => "udp",
        };
        let response_code = match &outcome {
            QueryOutcome::Reply(_) => "reply".to_string(),
            QueryOutcome::Timeout => "timeout".to_string(),
            QueryOutcome::Closed(reason) => format!("closed: {}", reason),
            QueryOutcome::CapsFail => "capsfail".to_string(),
        };
        self.logger.log_dns_query(
            &ctx,
            DnsQueryLog {
                domain: wire::format_qname(&entry.key.qname_lower),
                query_type: format!("{:?}", entry.qtype),
                protocol: transport.to_string(),
                response_code,
                upstream_server: entry.remote.to_string(),
                retry: entry.retry,
            },
        );

        for (_, mut cb) in entry.callbacks.drain(..) {
            cb(outcome.clone());
        }
    }

    fn check_caps(&self, entry: &ServicedEntry, reply: Vec<u8>) -> QueryOutcome {
        if !self.config.use_caps_for_id || entry.nocaps || entry.qtype == QueryType::Ptr {
            return QueryOutcome::Reply(reply);
        }
        let rcode = wire::rcode(&reply);
        let qdcount = wire::qdcount(&reply).unwrap_or(0);
        if qdcount == 0 {
            if matches!(rcode, Some(0) | Some(3)) {
                return QueryOutcome::Closed("no question section in reply to verify 0x20 caps".to_string());
            }
            return QueryOutcome::Reply(reply);
        }
        if !wire::qname_matches_bitwise(&reply, wire::question_qname_offset(), &entry.sent_qname) {
            return QueryOutcome::CapsFail;
        }
        QueryOutcome::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::config::OutgoingInterface;
    use crate::dns::event_loop::ReferenceEventLoop;
    use crate::dns::infra::InMemoryInfraCache;
    use crate::dns::dnstap::NullDnstapSink;
    use std::net::{IpAddr, Ipv4Addr, UdpSocket};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn loopback_config(num_ports: usize) -> Config {
        let mut config = Config::default();
        config.outgoing_interfaces = vec![OutgoingInterface::new(IpAddr::V4(Ipv4Addr::LOCALHOST))];
        config.num_ports = num_ports;
        config
    }

    fn make_engine(num_ports: usize) -> Engine {
        Engine::new(
            loopback_config(num_ports),
            Box::new(InMemoryInfraCache::new()),
            Box::new(NullDnstapSink),
        )
    }

    fn sample_query() -> Vec<u8> {
        let mut packet = vec![0u8; wire::HEADER_LEN];
        packet[5] = 1; // QDCOUNT = 1
        for label in ["example", "com"] {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
        packet
    }

    fn noerror_reply_to(query: &[u8]) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[2] = 0x80; // QR=1
        reply[3] = 0x00; // RCODE NOERROR
        reply
    }

    /// Scenario 1 (§8): a plain UDP query gets a NOERROR reply back and
    /// the callback fires exactly once with it.
    #[test]
    fn basic_udp_success_delivers_reply() {
        let mut engine = make_engine(4);
        let mut event_loop = ReferenceEventLoop::new();
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        upstream.set_nonblocking(true).unwrap();
        let remote = upstream.local_addr().unwrap();

        let spec = QuerySpec {
            base_packet: sample_query(),
            qtype: QueryType::A,
            qclass: 1,
            remote,
            dnssec: 0,
            dnssec_required: false,
            edns_opts: Vec::new(),
            nocaps: false,
            zone: None,
            timeout: Duration::from_secs(5),
            tcp_upstream: false,
            tls_upstream: false,
            tls_auth_name: None,
        };

        let delivered: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        engine.submit(
            spec,
            &mut event_loop,
            Box::new(move |outcome| {
                assert!(matches!(outcome, QueryOutcome::Reply(_)));
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut buf = [0u8; 512];
        let (n, client_addr) = upstream.recv_from(&mut buf).expect("query should have been sent");
        let received = buf[..n].to_vec();
        let reply = noerror_reply_to(&received);
        upstream.send_to(&reply, client_addr).unwrap();

        // Give the nonblocking loopback datagram a moment to be pollable.
        std::thread::sleep(Duration::from_millis(20));
        engine.tick(&mut event_loop);

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(engine.is_idle());
    }

    /// Scenario 5 (§8): two identical in-flight queries are coalesced
    /// into one wire transaction, and the single reply fans out to both
    /// registered callbacks.
    #[test]
    fn identical_queries_are_deduplicated() {
        let mut engine = make_engine(4);
        let mut event_loop = ReferenceEventLoop::new();
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        upstream.set_nonblocking(true).unwrap();
        let remote = upstream.local_addr().unwrap();

        let make_spec = || QuerySpec {
            base_packet: sample_query(),
            qtype: QueryType::A,
            qclass: 1,
            remote,
            dnssec: 0,
            dnssec_required: false,
            edns_opts: Vec::new(),
            nocaps: false,
            zone: None,
            timeout: Duration::from_secs(5),
            tcp_upstream: false,
            tls_upstream: false,
            tls_auth_name: None,
        };

        let delivered = Arc::new(AtomicUsize::new(0));
        let d1 = delivered.clone();
        let h1 = engine.submit(
            make_spec(),
            &mut event_loop,
            Box::new(move |_| {
                d1.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let d2 = delivered.clone();
        let h2 = engine.submit(
            make_spec(),
            &mut event_loop,
            Box::new(move |_| {
                d2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(h1, h2, "identical queries must coalesce onto the same serviced entry");

        let mut buf = [0u8; 512];
        let (n, client_addr) = upstream.recv_from(&mut buf).expect("one wire query expected");
        let received = buf[..n].to_vec();
        // Nothing else should have arrived — only one transaction was sent.
        upstream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(upstream.recv_from(&mut buf).is_err());

        let reply = noerror_reply_to(&received);
        upstream.send_to(&reply, client_addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        engine.tick(&mut event_loop);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    /// A UDP reply with TC set escalates the same serviced entry to TCP
    /// rather than delivering the truncated answer.
    #[test]
    fn truncated_udp_reply_escalates_to_tcp() {
        let mut engine = make_engine(4);
        let mut event_loop = ReferenceEventLoop::new();
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        upstream.set_nonblocking(true).unwrap();
        let remote = upstream.local_addr().unwrap();

        let spec = QuerySpec {
            base_packet: sample_query(),
            qtype: QueryType::A,
            qclass: 1,
            remote,
            dnssec: 0,
            dnssec_required: false,
            edns_opts: Vec::new(),
            nocaps: false,
            zone: None,
            timeout: Duration::from_secs(5),
            tcp_upstream: false,
            tls_upstream: false,
            tls_auth_name: None,
        };
        let handle = engine.submit(spec, &mut event_loop, Box::new(|_| {}));

        let mut buf = [0u8; 512];
        let (n, client_addr) = upstream.recv_from(&mut buf).expect("query should have been sent");
        let mut received = buf[..n].to_vec();
        received[2] = 0x82; // QR=1, TC=1
        upstream.send_to(&received, client_addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        engine.tick(&mut event_loop);

        // The entry is still in flight (now over TCP), not finished.
        assert!(engine.serviced.contains(handle));
        assert_eq!(engine.serviced.get(handle).unwrap().status, Status::Tcp);
    }

    #[test]
    fn udp_timeout_with_default_retry_budget_delivers_timeout_immediately() {
        let mut engine = make_engine(4);
        let mut event_loop = ReferenceEventLoop::new();
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53);

        let spec = QuerySpec {
            base_packet: sample_query(),
            qtype: QueryType::A,
            qclass: 1,
            remote,
            dnssec: 0,
            dnssec_required: false,
            edns_opts: Vec::new(),
            nocaps: false,
            zone: None,
            timeout: Duration::from_millis(1),
            tcp_upstream: false,
            tls_upstream: false,
            tls_auth_name: None,
        };
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        engine.submit(
            spec,
            &mut event_loop,
            Box::new(move |outcome| {
                assert!(matches!(outcome, QueryOutcome::Timeout));
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );

        std::thread::sleep(Duration::from_millis(10));
        engine.tick(&mut event_loop);

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(engine.is_idle());
    }

    #[test]
    fn stop_with_sole_callback_removes_the_entry() {
        let mut engine = make_engine(4);
        let mut event_loop = ReferenceEventLoop::new();
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53);
        let spec = QuerySpec {
            base_packet: sample_query(),
            qtype: QueryType::A,
            qclass: 1,
            remote,
            dnssec: 0,
            dnssec_required: false,
            edns_opts: Vec::new(),
            nocaps: false,
            zone: None,
            timeout: Duration::from_secs(5),
            tcp_upstream: false,
            tls_upstream: false,
            tls_auth_name: None,
        };
        let handle = engine.submit(spec, &mut event_loop, Box::new(|_| {
            panic!("stopped query must not be delivered");
        }));
        engine.stop(handle, 0);
        assert!(!engine.serviced.contains(handle));
        assert!(engine.is_idle());
    }
}
