//! TCP/TLS connection pool and reuse cache (§4.3), plus the TCP half of
//! the waiting lists (§4.4).
//!
//! Connections are nonblocking throughout: a slot's [`TcpStreamKind`]
//! tracks whether the underlying socket is still connecting, mid-TLS
//! handshake, or ready to read/write, and every operation here either
//! makes progress or returns `WouldBlock`-shaped "try again next tick"
//! outcomes rather than parking the single event-loop thread.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use openssl::ssl::{HandshakeError, MidHandshakeSslStream, SslConnector, SslMethod, SslStream};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use crate::dns::errors::EngineError;
use crate::dns::event_loop::EventLoop;
use crate::dns::metrics::REUSE_CACHE_TOTAL;
use crate::dns::slab::{Handle, Slab};
use crate::dns::wire;

/// Identifies a class of connections eligible to share pipelined queries
/// (§4.3): same remote address, same remote port, same TLS-or-not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReuseKey {
    addr: IpAddr,
    port: u16,
    tls: bool,
}

impl ReuseKey {
    pub fn new(remote: SocketAddr, tls: bool) -> Self {
        ReuseKey { addr: remote.ip(), port: remote.port(), tls }
    }
}

enum TcpStreamKind {
    Connecting(TcpStream),
    TlsHandshaking(MidHandshakeSslStream<TcpStream>),
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl TcpStreamKind {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TcpStreamKind::Plain(s) => s.read(buf),
            TcpStreamKind::Tls(s) => s.read(buf),
            _ => Err(io::Error::new(ErrorKind::WouldBlock, "handshake in progress")),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TcpStreamKind::Plain(s) => s.write(buf),
            TcpStreamKind::Tls(s) => s.write(buf),
            _ => Err(io::Error::new(ErrorKind::WouldBlock, "handshake in progress")),
        }
    }
}

/// One query awaiting a reply on a slot, keyed by the DNS transaction ID
/// used to demux incoming bytes (§4.3). Carries its own event-loop timer
/// so it can be failed individually without disturbing any sibling query
/// pipelined on the same connection.
struct QueryEntry {
    owner: u64,
    timer: Handle,
    /// The caller's own timeout, stashed so the write timeout (§5) can be
    /// rearmed with the same value each time this query begins writing.
    timeout: Duration,
}

struct Slot {
    remote: SocketAddr,
    tls: bool,
    stream: TcpStreamKind,
    reuse_key: ReuseKey,
    by_id: BTreeMap<u16, QueryEntry>,
    write_queue: VecDeque<Vec<u8>>,
    write_progress: usize,
    read_buf: Vec<u8>,
    lru_prev: Option<Handle>,
    lru_next: Option<Handle>,
    last_used: Instant,
    /// Set once closing has begun (e.g. evicted while a write was still
    /// in flight); such a slot is never offered to `find_reusable`.
    closing: bool,
    /// Armed while the socket is still connecting or mid-TLS-handshake
    /// (§4.6's `TCP_AUTH_QUERY_TIMEOUT`); taken and dropped the first
    /// time the slot is polled past the handshake step. A fired connect
    /// timer fails every query outstanding on the slot (§4.3, §4.4).
    connect_timer: Option<Handle>,
}

impl Slot {
    fn reusable(&self, max_reuse_tcp_queries: usize) -> bool {
        !self.closing && self.by_id.len() < max_reuse_tcp_queries
    }
}

struct WaitingTcpEntry {
    remote: SocketAddr,
    tls: bool,
    sni: Option<String>,
    query: Vec<u8>,
    owner: u64,
    timeout: Duration,
    /// §4.4: a wait-listed query carries its own timer so it can fail
    /// back to the caller if the pool never frees a slot for it.
    timer: Handle,
}

pub enum SendOutcome {
    /// Queued for write on an existing or newly opened connection.
    Queued(Handle),
    Waiting,
    Failed(EngineError),
}

pub enum PollOutcome {
    Idle,
    WroteQuery,
    /// One complete length-prefixed reply was demultiplexed off this
    /// connection and matched to its owner.
    Reply { owner: u64, data: Vec<u8> },
    /// The peer closed, or the socket errored; every still-outstanding
    /// query on this slot is reported so its owner can retry elsewhere.
    Closed(Vec<u64>),
}

/// What a fired TCP timer (as resolved by [`TcpEngine::handle_timer`])
/// turned out to be.
pub enum TcpTimerFired {
    /// A query parked on the global wait FIFO never got a slot in time.
    Waiting(u64),
    /// A single query on an open connection (queued-for-write or awaiting
    /// reply) timed out; the connection itself is left open for its
    /// other pipelined queries.
    Query(u64),
    /// The connection itself never finished connecting/handshaking, or a
    /// write made no progress before its timeout; every query
    /// outstanding on it times out together.
    Connect(Vec<u64>),
}

pub struct TcpEngine {
    slots: Slab<Slot>,
    reuse_tree: BTreeMap<(ReuseKey, Handle), ()>,
    lru_head: Option<Handle>,
    lru_tail: Option<Handle>,
    global_wait: VecDeque<WaitingTcpEntry>,
    open_count: usize,
    num_tcp: usize,
    tcp_reuse_max: usize,
    max_reuse_tcp_queries: usize,
    dscp: u8,
    tcp_mss: Option<u32>,
    tls_use_sni: bool,
    /// §4.6: default connect timeout (`TCP_AUTH_QUERY_TIMEOUT`), used
    /// unless the per-query timeout passed to `send_tcp` is already
    /// higher (a caller that already believes the peer is slow gets at
    /// least that much time to connect).
    tcp_auth_query_timeout: Duration,
    /// Candidate source addresses for outgoing connections (§4.3 step
    /// 2); empty means "bind to ANY", i.e. let the OS choose.
    outgoing_interfaces: Vec<IpAddr>,
}

impl TcpEngine {
    pub fn new(
        num_tcp: usize,
        tcp_reuse_max: usize,
        max_reuse_tcp_queries: usize,
        dscp: u8,
        tcp_mss: Option<u32>,
        tls_use_sni: bool,
        tcp_auth_query_timeout: Duration,
    ) -> Self {
        Self::with_interfaces(
            num_tcp,
            tcp_reuse_max,
            max_reuse_tcp_queries,
            dscp,
            tcp_mss,
            tls_use_sni,
            tcp_auth_query_timeout,
            Vec::new(),
        )
    }

    pub fn with_interfaces(
        num_tcp: usize,
        tcp_reuse_max: usize,
        max_reuse_tcp_queries: usize,
        dscp: u8,
        tcp_mss: Option<u32>,
        tls_use_sni: bool,
        tcp_auth_query_timeout: Duration,
        outgoing_interfaces: Vec<IpAddr>,
    ) -> Self {
        TcpEngine {
            slots: Slab::new(),
            reuse_tree: BTreeMap::new(),
            lru_head: None,
            lru_tail: None,
            global_wait: VecDeque::new(),
            open_count: 0,
            num_tcp,
            tcp_reuse_max,
            max_reuse_tcp_queries,
            dscp,
            tcp_mss,
            tls_use_sni,
            tcp_auth_query_timeout,
            outgoing_interfaces,
        }
    }

    /// A random configured source address matching `remote`'s family, if
    /// any was configured — otherwise `None` ("skip bind if interface is
    /// ANY", §4.3 step 2).
    fn random_source_addr(&self, remote: SocketAddr) -> Option<IpAddr> {
        let candidates: Vec<IpAddr> = self
            .outgoing_interfaces
            .iter()
            .copied()
            .filter(|a| a.is_ipv4() == remote.is_ipv4())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rand::thread_rng().gen_range(0, candidates.len())])
    }

    fn find_reusable(&self, key: ReuseKey) -> Option<Handle> {
        // Range over the half-open interval of all (key, *) entries;
        // slot identity is only a tie-break within one key, never
        // load-bearing for the search itself.
        let start = (key, Handle::MIN);
        for ((k, handle), ()) in self.reuse_tree.range(start..) {
            if *k != key {
                break;
            }
            if let Some(slot) = self.slots.get(*handle) {
                if slot.reusable(self.max_reuse_tcp_queries) {
                    return Some(*handle);
                }
            }
        }
        None
    }

    fn lru_remove(&mut self, handle: Handle) {
        let (prev, next) = match self.slots.get(handle) {
            Some(s) => (s.lru_prev, s.lru_next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(s) = self.slots.get_mut(p) {
                    s.lru_next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Some(s) = self.slots.get_mut(n) {
                    s.lru_prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
    }

    fn lru_push_front(&mut self, handle: Handle) {
        let old_head = self.lru_head;
        if let Some(s) = self.slots.get_mut(handle) {
            s.lru_prev = None;
            s.lru_next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(s) = self.slots.get_mut(h) {
                s.lru_prev = Some(handle);
            }
        }
        self.lru_head = Some(handle);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(handle);
        }
    }

    fn touch(&mut self, handle: Handle) {
        self.lru_remove(handle);
        self.lru_push_front(handle);
        if let Some(s) = self.slots.get_mut(handle) {
            s.last_used = Instant::now();
        }
    }

    /// Evicts the least-recently-used reusable connection. Returns the
    /// owners of any queries still outstanding on it, who must be
    /// retried elsewhere.
    pub fn close_oldest_reusable(&mut self, event_loop: &mut dyn EventLoop) -> Option<Vec<u64>> {
        let handle = self.lru_tail?;
        REUSE_CACHE_TOTAL.with_label_values(&["evict"]).inc();
        Some(self.close_slot(handle, event_loop))
    }

    /// Tears down `handle` entirely: removes it from the LRU list and
    /// reuse tree, drops its connect timer and every per-query timer
    /// still outstanding on it, and returns their owners so the caller
    /// can fail them with `CLOSED` (§4.3).
    fn close_slot(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) -> Vec<u64> {
        self.lru_remove(handle);
        let key = self.slots.get(handle).map(|s| s.reuse_key);
        if let Some(key) = key {
            self.reuse_tree.remove(&(key, handle));
        }
        let owners = match self.slots.remove(handle) {
            Some(slot) => {
                if let Some(timer) = slot.connect_timer {
                    event_loop.drop_timer(timer);
                }
                slot.by_id
                    .into_values()
                    .map(|entry| {
                        event_loop.drop_timer(entry.timer);
                        entry.owner
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        self.open_count = self.open_count.saturating_sub(1);
        owners
    }

    /// `select_reuse_id` (§4.3): MAX_ID_RETRY random attempts, then a
    /// uniformly random choice among the unused IDs located by walking
    /// the sorted gaps in the in-use set ("to retain entropy" even once
    /// the connection is densely populated).
    fn select_id(by_id: &BTreeMap<u16, QueryEntry>) -> Option<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let candidate: u16 = rng.gen();
            if !by_id.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        let used = by_id.len();
        if used >= 65536 {
            return None;
        }
        let free = (65536 - used) as u32;
        let mut select = rng.gen_range(0, free);
        let mut prev = 0u32;
        for &id in by_id.keys() {
            let id = id as u32;
            if id > prev {
                let gap = id - prev;
                if select < gap {
                    return Some((prev + select) as u16);
                }
                select -= gap;
            }
            prev = id + 1;
        }
        // The trailing gap after the last in-use ID, up to 65536.
        Some((prev + select) as u16)
    }

    fn open_socket(
        remote: SocketAddr,
        dscp: u8,
        tcp_mss: Option<u32>,
        source: Option<IpAddr>,
    ) -> io::Result<TcpStream> {
        let domain = if remote.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        if dscp != 0 {
            let tos = (dscp as u32) << 2;
            let _ = socket.set_tos(tos);
        }
        if let Some(mss) = tcp_mss {
            let _ = socket.set_mss(mss);
        }
        if let Some(addr) = source {
            socket.bind(&SocketAddr::new(addr, 0).into())?;
        }
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        Ok(socket.into())
    }

    /// `outnet_tcp_take_into_use`: opens a fresh connection to `remote`
    /// and registers its slot, arming its connect timer (§4.6), without
    /// yet writing anything to it.
    fn take_into_use(
        &mut self,
        remote: SocketAddr,
        tls: bool,
        sni: Option<&str>,
        connect_timeout: Duration,
        event_loop: &mut dyn EventLoop,
    ) -> Result<Handle, EngineError> {
        let source = self.random_source_addr(remote);
        let tcp = Self::open_socket(remote, self.dscp, self.tcp_mss, source).map_err(EngineError::from)?;
        let stream = if tls {
            let connector = SslConnector::builder(SslMethod::tls())
                .map_err(|e| EngineError::Closed(e.to_string()))?
                .build();
            let ssl_result = if self.tls_use_sni {
                connector.connect(sni.unwrap_or(""), tcp)
            } else {
                connector.configure().and_then(|mut c| {
                    c.set_use_server_name_indication(false);
                    c.connect(sni.unwrap_or(""), tcp)
                })
                .map_err(|e| HandshakeError::SetupFailure(e))
            };
            match ssl_result {
                Ok(established) => TcpStreamKind::Tls(established),
                Err(HandshakeError::WouldBlock(mid)) => TcpStreamKind::TlsHandshaking(mid),
                Err(e) => return Err(EngineError::Closed(e.to_string())),
            }
        } else {
            TcpStreamKind::Plain(tcp)
        };

        let connect_timer = event_loop.create_timer();
        event_loop.arm_timer(connect_timer, connect_timeout);

        let key = ReuseKey::new(remote, tls);
        let handle = self.slots.insert(Slot {
            remote,
            tls,
            stream,
            reuse_key: key,
            by_id: BTreeMap::new(),
            write_queue: VecDeque::new(),
            write_progress: 0,
            read_buf: Vec::new(),
            lru_prev: None,
            lru_next: None,
            last_used: Instant::now(),
            closing: false,
            connect_timer: Some(connect_timer),
        });
        self.reuse_tree.insert((key, handle), ());
        self.lru_push_front(handle);
        self.open_count += 1;
        Ok(handle)
    }

    /// `send_tcp`: finds a reusable connection for `(remote, tls)`,
    /// opens a fresh one if the pool has headroom, evicts the LRU
    /// reusable connection if the pool is full, or else parks the query
    /// on the global TCP FIFO (§4.4). `timeout` is the caller's own
    /// per-query timeout, used both for the wait-list/write timer and,
    /// where higher than the configured default, for a freshly opened
    /// connection's connect timeout (§4.6). The second element of the
    /// return value lists owners of queries evicted as a side effect of
    /// making room for this one (§4.3); they must be failed with
    /// `CLOSED` by the caller.
    pub fn send_tcp(
        &mut self,
        owner: u64,
        remote: SocketAddr,
        tls: bool,
        sni: Option<&str>,
        mut query: Vec<u8>,
        timeout: Duration,
        event_loop: &mut dyn EventLoop,
    ) -> (SendOutcome, Vec<u64>) {
        let key = ReuseKey::new(remote, tls);
        let connect_timeout = self.tcp_auth_query_timeout.max(timeout);
        let mut evicted = Vec::new();
        let handle = if let Some(h) = self.find_reusable(key) {
            REUSE_CACHE_TOTAL.with_label_values(&["hit"]).inc();
            h
        } else if self.open_count < self.num_tcp {
            REUSE_CACHE_TOTAL.with_label_values(&["miss"]).inc();
            match self.take_into_use(remote, tls, sni, connect_timeout, event_loop) {
                Ok(h) => h,
                Err(e) => return (SendOutcome::Failed(e), evicted),
            }
        } else if let Some(owners) = self.close_oldest_reusable(event_loop) {
            evicted = owners;
            match self.take_into_use(remote, tls, sni, connect_timeout, event_loop) {
                Ok(h) => h,
                Err(e) => return (SendOutcome::Failed(e), evicted),
            }
        } else {
            let timer = event_loop.create_timer();
            event_loop.arm_timer(timer, timeout);
            self.global_wait.push_back(WaitingTcpEntry {
                remote,
                tls,
                sni: sni.map(str::to_string),
                query,
                owner,
                timeout,
                timer,
            });
            return (SendOutcome::Waiting, evicted);
        };

        let id = {
            let slot = match self.slots.get(handle) {
                Some(s) => s,
                None => return (SendOutcome::Failed(EngineError::Closed("slot vanished".to_string())), evicted),
            };
            match Self::select_id(&slot.by_id) {
                Some(id) => id,
                None => {
                    return (
                        SendOutcome::Failed(EngineError::Closed("TCP ID space exhausted".to_string())),
                        evicted,
                    )
                }
            }
        };

        wire::write_id(&mut query, id);
        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(&query);

        let query_timer = event_loop.create_timer();
        event_loop.arm_timer(query_timer, timeout);
        if let Some(slot) = self.slots.get_mut(handle) {
            slot.by_id.insert(id, QueryEntry { owner, timer: query_timer, timeout });
            slot.write_queue.push_back(framed);
        }
        self.touch(handle);
        (SendOutcome::Queued(handle), evicted)
    }

    /// Makes progress writing queued queries on `handle`. Call when the
    /// event loop reports the connection's socket writable.
    pub fn on_writable(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) -> PollOutcome {
        let slot = match self.slots.get_mut(handle) {
            Some(s) => s,
            None => return PollOutcome::Idle,
        };
        if let TcpStreamKind::TlsHandshaking(_) = slot.stream {
            return self.pump_handshake(handle, event_loop);
        }
        let front = match slot.write_queue.front() {
            Some(f) => f.clone(),
            None => return PollOutcome::Idle,
        };
        if slot.write_progress == 0 && front.len() >= 4 {
            // §5: the write timeout resets each time the slot begins
            // writing a new packet, using that query's own timeout.
            let id = u16::from_be_bytes([front[2], front[3]]);
            if let Some(entry) = slot.by_id.get(&id) {
                event_loop.arm_timer(entry.timer, entry.timeout);
            }
        }
        match slot.stream.write(&front[slot.write_progress..]) {
            Ok(0) => {
                // A zero-length write on a stream socket still proves the
                // connect completed; only a genuine WouldBlock means
                // "still connecting" and must leave the timer armed.
                if let Some(timer) = slot.connect_timer.take() {
                    event_loop.drop_timer(timer);
                }
                PollOutcome::Idle
            }
            Ok(n) => {
                if let Some(timer) = slot.connect_timer.take() {
                    event_loop.drop_timer(timer);
                }
                slot.write_progress += n;
                if slot.write_progress >= front.len() {
                    slot.write_queue.pop_front();
                    slot.write_progress = 0;
                    PollOutcome::WroteQuery
                } else {
                    PollOutcome::Idle
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => PollOutcome::Idle,
            Err(_) => PollOutcome::Closed(self.close_slot(handle, event_loop)),
        }
    }

    fn pump_handshake(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) -> PollOutcome {
        let slot = match self.slots.get_mut(handle) {
            Some(s) => s,
            None => return PollOutcome::Idle,
        };
        let prior = std::mem::replace(&mut slot.stream, TcpStreamKind::Connecting(dummy_stream()));
        let next = match prior {
            TcpStreamKind::TlsHandshaking(mid) => match mid.handshake() {
                Ok(established) => TcpStreamKind::Tls(established),
                Err(HandshakeError::WouldBlock(mid)) => TcpStreamKind::TlsHandshaking(mid),
                Err(_) => {
                    drop(slot);
                    return PollOutcome::Closed(self.close_slot(handle, event_loop));
                }
            },
            other => other,
        };
        if let Some(slot) = self.slots.get_mut(handle) {
            slot.stream = next;
        }
        PollOutcome::Idle
    }

    /// Reads and demultiplexes one length-prefixed reply off `handle`,
    /// if a complete frame is buffered.
    pub fn on_readable(&mut self, handle: Handle, event_loop: &mut dyn EventLoop) -> PollOutcome {
        let slot = match self.slots.get_mut(handle) {
            Some(s) => s,
            None => return PollOutcome::Idle,
        };
        if let TcpStreamKind::TlsHandshaking(_) = slot.stream {
            return self.pump_handshake(handle, event_loop);
        }
        let mut buf = [0u8; 4096];
        match slot.stream.read(&mut buf) {
            Ok(0) => return PollOutcome::Closed(self.close_slot(handle, event_loop)),
            Ok(n) => {
                // A genuine read, like a genuine write, only happens once
                // the connect has actually completed; WouldBlock below is
                // the only outcome that still means "still connecting".
                if let Some(timer) = slot.connect_timer.take() {
                    event_loop.drop_timer(timer);
                }
                slot.read_buf.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return PollOutcome::Idle,
            Err(_) => return PollOutcome::Closed(self.close_slot(handle, event_loop)),
        }

        if slot.read_buf.len() < 2 {
            return PollOutcome::Idle;
        }
        let len = u16::from_be_bytes([slot.read_buf[0], slot.read_buf[1]]) as usize;
        if slot.read_buf.len() < 2 + len {
            return PollOutcome::Idle;
        }
        let frame: Vec<u8> = slot.read_buf.drain(..2 + len).skip(2).collect();
        let id = if frame.len() >= 2 { u16::from_be_bytes([frame[0], frame[1]]) } else { 0 };
        let entry = match slot.by_id.remove(&id) {
            // §4.3: an ID that matches nothing expected desyncs the
            // stream's framing for every other pipelined query on it —
            // the whole connection is treated as errored.
            None => return PollOutcome::Closed(self.close_slot(handle, event_loop)),
            Some(entry) => entry,
        };
        event_loop.drop_timer(entry.timer);
        if slot.by_id.is_empty() {
            self.touch(handle);
        }
        PollOutcome::Reply { owner: entry.owner, data: frame }
    }

    /// Looks up what a fired event-loop timer corresponds to, tears down
    /// the matching state, and reports which owner(s) to notify.
    /// Mirrors `UdpEngine::handle_timeout`'s "remove from the registry
    /// before the caller gets to act on it" ordering.
    pub fn handle_timer(&mut self, timer: Handle, event_loop: &mut dyn EventLoop) -> Option<TcpTimerFired> {
        if let Some(pos) = self.global_wait.iter().position(|w| w.timer == timer) {
            let entry = self.global_wait.remove(pos).expect("position just found");
            event_loop.drop_timer(entry.timer);
            return Some(TcpTimerFired::Waiting(entry.owner));
        }

        let query_slot = self.slots.iter().find_map(|(handle, slot)| {
            slot.by_id.iter().find(|(_, e)| e.timer == timer).map(|(&id, _)| (handle, id))
        });
        if let Some((handle, id)) = query_slot {
            if let Some(owner) = self.fail_query(handle, id, event_loop) {
                return Some(TcpTimerFired::Query(owner));
            }
        }

        let stalled = self.slots.iter().find(|(_, s)| s.connect_timer == Some(timer)).map(|(h, _)| h);
        if let Some(handle) = stalled {
            let owners = self.close_slot(handle, event_loop);
            return Some(TcpTimerFired::Connect(owners));
        }

        None
    }

    /// Removes a single query's state from `handle` (both its `by_id`
    /// demux entry and any still-queued write), without disturbing the
    /// rest of the connection.
    fn fail_query(&mut self, handle: Handle, id: u16, event_loop: &mut dyn EventLoop) -> Option<u64> {
        let slot = self.slots.get_mut(handle)?;
        let entry = slot.by_id.remove(&id)?;
        event_loop.drop_timer(entry.timer);
        if let Some(pos) = slot
            .write_queue
            .iter()
            .position(|f| f.len() >= 4 && u16::from_be_bytes([f[2], f[3]]) == id)
        {
            slot.write_queue.remove(pos);
            if pos == 0 {
                slot.write_progress = 0;
            }
        }
        if slot.by_id.is_empty() {
            self.touch(handle);
        }
        Some(entry.owner)
    }

    /// Drains the global TCP FIFO while the pool has headroom or a
    /// reusable connection is available. Each drained entry's own result
    /// carries any owners evicted to make room for it.
    pub fn drain_wait_queue(&mut self, event_loop: &mut dyn EventLoop) -> Vec<(u64, SendOutcome, Vec<u64>)> {
        let mut results = Vec::new();
        while let Some(entry) = self.global_wait.pop_front() {
            event_loop.drop_timer(entry.timer);
            let (outcome, evicted) = self.send_tcp(
                entry.owner,
                entry.remote,
                entry.tls,
                entry.sni.as_deref(),
                entry.query,
                entry.timeout,
                event_loop,
            );
            let waiting = matches!(outcome, SendOutcome::Waiting);
            results.push((entry.owner, outcome, evicted));
            if waiting {
                break;
            }
        }
        results
    }

    pub fn open_count(&self) -> usize {
        self.open_count
    }

    /// Every open slot's handle, for the engine's tick loop to poll
    /// read/write readiness against (sockets are nonblocking; a slot with
    /// nothing to do simply returns `Idle`).
    pub fn open_handles(&self) -> Vec<Handle> {
        self.slots.iter().map(|(h, _)| h).collect()
    }

    pub fn reuse_len(&self) -> usize {
        self.reuse_tree.len()
    }

    /// Idle reused connections older than `reuse_timeout` and not
    /// currently writing/awaiting a reply are closed (§4.3 keepalive).
    pub fn sweep_idle(&mut self, reuse_timeout: Duration, event_loop: &mut dyn EventLoop) {
        let now = Instant::now();
        let stale: Vec<Handle> = self
            .slots
            .iter()
            .filter(|(_, s)| s.by_id.is_empty() && s.write_queue.is_empty())
            .filter(|(_, s)| now.duration_since(s.last_used) >= reuse_timeout)
            .map(|(h, _)| h)
            .collect();
        for handle in stale {
            self.close_slot(handle, event_loop);
        }
    }
}

fn dummy_stream() -> TcpStream {
    // Used only as a transient placeholder while swapping a slot's
    // `TcpStreamKind` out from behind a `&mut` during handshake pumping;
    // never observed outside `pump_handshake`.
    Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .and_then(|s| {
            s.set_nonblocking(true)?;
            Ok(s.into())
        })
        .expect("ephemeral TCP socket creation should not fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::event_loop::ReferenceEventLoop;

    #[test]
    fn reuse_key_groups_by_addr_port_and_tls() {
        let a = "192.0.2.1:53".parse().unwrap();
        let b = "192.0.2.1:53".parse().unwrap();
        assert_eq!(ReuseKey::new(a, false), ReuseKey::new(b, false));
        assert_ne!(ReuseKey::new(a, false), ReuseKey::new(b, true));
    }

    #[test]
    fn select_id_avoids_every_in_use_id() {
        let mut loop_ = ReferenceEventLoop::new();
        let mut by_id = BTreeMap::new();
        for id in 0..10u16 {
            by_id.insert(id, QueryEntry { owner: 0, timer: loop_.create_timer(), timeout: Duration::from_secs(5) });
        }
        let picked = TcpEngine::select_id(&by_id).unwrap();
        assert!(!by_id.contains_key(&picked));
    }

    #[test]
    fn lru_order_reflects_touch() {
        let mut engine = TcpEngine::new(4, 4, 200, 0, None, true, Duration::from_secs(5));
        let mut loop_ = ReferenceEventLoop::new();
        let h1 = engine.slots.insert(Slot {
            remote: "192.0.2.1:53".parse().unwrap(),
            tls: false,
            stream: TcpStreamKind::Plain(dummy_stream()),
            reuse_key: ReuseKey::new("192.0.2.1:53".parse().unwrap(), false),
            by_id: BTreeMap::new(),
            write_queue: VecDeque::new(),
            write_progress: 0,
            read_buf: Vec::new(),
            lru_prev: None,
            lru_next: None,
            last_used: Instant::now(),
            closing: false,
            connect_timer: Some(loop_.create_timer()),
        });
        engine.lru_push_front(h1);
        assert_eq!(engine.lru_head, Some(h1));
        assert_eq!(engine.lru_tail, Some(h1));
    }
}
