//! Pending-UDP registry and UDP send/receive path (§4.2), plus the UDP
//! half of the waiting lists (§4.4).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;

use crate::dns::errors::EngineError;
use crate::dns::event_loop::EventLoop;
use crate::dns::iface::{family_of, IfacePool};
use crate::dns::metrics::{QUERIES_SENT_TOTAL, REPLIES_RECEIVED_TOTAL, UNWANTED_REPLIES_TOTAL};
use crate::dns::slab::{Handle, Slab};
use crate::dns::wire;

/// Outcome of attempting to send (or resend) a UDP query. `Sent` carries
/// the handle of the now-registered [`PendingUdpQuery`]; `Waiting` means
/// it was parked on the global UDP FIFO because no source port was free.
pub enum SendOutcome {
    Sent(Handle),
    Waiting,
    Failed(EngineError),
}

/// One outstanding UDP query (§3). Keyed in the registry by (id, remote).
pub struct PendingUdpQuery {
    pub remote: SocketAddr,
    pub id: u16,
    pub port: Handle,
    pub timer: Handle,
    /// Owner identity in the serviced-query registry; the UDP layer
    /// never stores a callback directly — it hands the owner handle back
    /// to the engine, which looks the serviced entry up and dispatches.
    pub owner: u64,
}

struct WaitingUdpEntry {
    remote: SocketAddr,
    query: Vec<u8>,
    timeout: Duration,
    owner: u64,
}

/// What happened to a UDP socket readable event.
pub enum RecvOutcome {
    /// Registry match: owner, reply bytes, and the port handle whose
    /// `outstanding` the caller must lower.
    Matched { owner: u64, reply: Vec<u8>, port: Handle },
    /// No match, or match on the wrong socket (§4.2's pinned oddity:
    /// both count identically as unwanted and neither disarms a timer).
    Unwanted,
    /// Threshold crossed; caller should invoke the cache-clearing hook.
    UnwantedThresholdCrossed,
}

pub struct UdpEngine {
    ifaces: IfacePool,
    pending: HashMap<(u16, SocketAddr), Handle>,
    pending_slab: Slab<PendingUdpQuery>,
    wait_queue: VecDeque<WaitingUdpEntry>,
    unwanted_replies: u64,
    unwanted_threshold: Option<u64>,
    max_id_retry: u32,
}

impl UdpEngine {
    pub fn new(ifaces: IfacePool, max_id_retry: u32, unwanted_threshold: Option<u64>) -> Self {
        UdpEngine {
            ifaces,
            pending: HashMap::new(),
            pending_slab: Slab::new(),
            wait_queue: VecDeque::new(),
            unwanted_replies: 0,
            unwanted_threshold,
            max_id_retry,
        }
    }

    pub fn ifaces(&self) -> &IfacePool {
        &self.ifaces
    }

    pub fn ifaces_mut(&mut self) -> &mut IfacePool {
        &mut self.ifaces
    }

    pub fn pending(&self, handle: Handle) -> Option<&PendingUdpQuery> {
        self.pending_slab.get(handle)
    }

    fn pick_unused_id(&self, remote: SocketAddr) -> Option<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.max_id_retry {
            let candidate: u16 = rng.gen();
            if !self.pending.contains_key(&(candidate, remote)) {
                return Some(candidate);
            }
        }
        None
    }

    /// `send_udp`: picks a fresh ID, acquires a source port, sends, and
    /// arms the per-query timeout timer. Returns `Waiting` if no port
    /// was available — the caller is enqueued on the global UDP FIFO
    /// (§4.4) rather than failed outright.
    pub fn send_udp(
        &mut self,
        owner: u64,
        remote: SocketAddr,
        packet: &mut Vec<u8>,
        timeout: Duration,
        event_loop: &mut dyn EventLoop,
    ) -> SendOutcome {
        let id = match self.pick_unused_id(remote) {
            Some(id) => id,
            None => {
                log::error!("send_udp: MAX_ID_RETRY exhausted for {}", remote);
                return SendOutcome::Failed(EngineError::Closed(
                    "no unique transaction ID available".to_string(),
                ));
            }
        };
        wire::write_id(packet, id);

        let port = match self.ifaces.select_ifport(family_of(remote)) {
            Ok(port) => port,
            Err(_) => {
                self.wait_queue.push_back(WaitingUdpEntry {
                    remote,
                    query: packet.clone(),
                    timeout,
                    owner,
                });
                return SendOutcome::Waiting;
            }
        };

        let socket = match self.ifaces.socket(port) {
            Some(s) => s,
            None => return SendOutcome::Failed(EngineError::Closed("port vanished".to_string())),
        };
        if let Err(e) = socket.send_to(packet, remote) {
            self.ifaces.lower_use(port);
            return SendOutcome::Failed(EngineError::Io(e.to_string()));
        }

        self.ifaces.raise_use(port);
        let timer = event_loop.create_timer();
        event_loop.arm_timer(timer, timeout);

        let handle = self.pending_slab.insert(PendingUdpQuery { remote, id, port, timer, owner });
        self.pending.insert((id, remote), handle);
        QUERIES_SENT_TOTAL.with_label_values(&["udp"]).inc();
        SendOutcome::Sent(handle)
    }

    /// `udp_cb`: called when a registered port-commitment socket reports
    /// readable. `owning_port` is the handle of the socket that actually
    /// became readable, used to implement the "wrong socket" check.
    pub fn recv_on(
        &mut self,
        owning_port: Handle,
        packet: Vec<u8>,
        peer: SocketAddr,
        event_loop: &mut dyn EventLoop,
    ) -> RecvOutcome {
        if packet.len() < wire::HEADER_LEN {
            return self.count_unwanted();
        }
        let id = match wire::read_id(&packet) {
            Some(id) => id,
            None => return self.count_unwanted(),
        };
        let key = (id, peer);
        let handle = match self.pending.get(&key).copied() {
            Some(h) => h,
            None => return self.count_unwanted(),
        };
        let pending = match self.pending_slab.get(handle) {
            Some(p) => p,
            None => return self.count_unwanted(),
        };
        if pending.port != owning_port {
            // Spec-pinned oddity (§9 open question): treated as
            // unwanted, but — deliberately — we do *not* disarm the
            // original timer here either.
            return self.count_unwanted();
        }

        // Remove from the registry before dispatch so a reentrant
        // callback may register a fresh pending entry with this same ID
        // (§4.2, §5).
        self.pending.remove(&key);
        let pending = self.pending_slab.remove(handle).expect("checked above");
        event_loop.disarm_timer(pending.timer);
        event_loop.drop_timer(pending.timer);
        self.ifaces.lower_use(pending.port);

        REPLIES_RECEIVED_TOTAL.with_label_values(&["udp"]).inc();
        RecvOutcome::Matched { owner: pending.owner, reply: packet, port: pending.port }
    }

    fn count_unwanted(&mut self) -> RecvOutcome {
        UNWANTED_REPLIES_TOTAL.with_label_values(&["udp"]).inc();
        self.unwanted_replies += 1;
        match self.unwanted_threshold {
            Some(threshold) if self.unwanted_replies >= threshold => {
                self.unwanted_replies = 0;
                RecvOutcome::UnwantedThresholdCrossed
            }
            _ => RecvOutcome::Unwanted,
        }
    }

    /// Timer fired before a reply arrived. Removes the registry entry
    /// and returns the owner so the engine can decide (retry/fallback)
    /// and the port so its `outstanding` can be lowered — unless
    /// `delayclose` asked us to keep the port open a little longer for
    /// a straggling reply, in which case the caller rearms us instead.
    pub fn handle_timeout(&mut self, handle: Handle) -> Option<(u64, SocketAddr, Handle)> {
        let pending = self.pending_slab.get(handle)?;
        let key = (pending.id, pending.remote);
        let owner = pending.owner;
        let remote = pending.remote;
        let port = pending.port;
        self.pending.remove(&key);
        self.pending_slab.remove(handle);
        Some((owner, remote, port))
    }

    pub fn release_port_after_delayclose(&mut self, port: Handle) {
        self.ifaces.lower_use(port);
    }

    /// Finds the pending entry armed with event-loop timer `timer`, so the
    /// engine's tick loop can resolve a fired timer back to its query.
    pub fn find_by_timer(&self, timer: Handle) -> Option<Handle> {
        self.pending_slab.iter().find(|(_, p)| p.timer == timer).map(|(h, _)| h)
    }

    /// Drains as much of the global UDP wait FIFO as currently-free
    /// ports allow, returning what happened to each drained entry so the
    /// engine can notify its owner.
    pub fn drain_wait_queue(&mut self, event_loop: &mut dyn EventLoop) -> Vec<(u64, SendOutcome)> {
        let mut results = Vec::new();
        while let Some(entry) = self.wait_queue.pop_front() {
            let mut packet = entry.query;
            let outcome = self.send_udp(entry.owner, entry.remote, &mut packet, entry.timeout, event_loop);
            let is_waiting = matches!(outcome, SendOutcome::Waiting);
            results.push((entry.owner, outcome));
            if is_waiting {
                // Still no port free; put back and stop for this pass.
                break;
            }
        }
        results
    }

    pub fn wait_queue_is_empty(&self) -> bool {
        self.wait_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::config::OutgoingInterface;
    use crate::dns::event_loop::ReferenceEventLoop;
    use std::net::{IpAddr, Ipv4Addr};

    fn engine(num_ports: usize) -> UdpEngine {
        let ifaces = crate::dns::iface::IfacePool::new(
            &[OutgoingInterface::new(IpAddr::V4(Ipv4Addr::LOCALHOST))],
            num_ports,
            1000,
        );
        UdpEngine::new(ifaces, 1000, None)
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53)
    }

    #[test]
    fn send_and_timeout_cleans_up_pending_and_port() {
        let mut udp = engine(4);
        let mut loop_ = ReferenceEventLoop::new();
        let mut packet = vec![0u8; 12];
        let handle = match udp.send_udp(1, peer(), &mut packet, Duration::from_millis(10), &mut loop_) {
            SendOutcome::Sent(h) => h,
            _ => panic!("expected Sent"),
        };
        let port = udp.pending(handle).unwrap().port;
        assert_eq!(udp.ifaces().outstanding(port), Some(1));

        let (owner, _remote, port_again) = udp.handle_timeout(handle).unwrap();
        assert_eq!(owner, 1);
        udp.release_port_after_delayclose(port_again);
        assert_eq!(udp.ifaces().outstanding(port), None);
    }

    #[test]
    fn id_collision_is_avoided_across_two_sends_to_same_peer() {
        let mut udp = engine(4);
        let mut loop_ = ReferenceEventLoop::new();
        let mut a = vec![0u8; 12];
        let mut b = vec![0u8; 12];
        let ha = match udp.send_udp(1, peer(), &mut a, Duration::from_secs(5), &mut loop_) {
            SendOutcome::Sent(h) => h,
            _ => panic!(),
        };
        let hb = match udp.send_udp(2, peer(), &mut b, Duration::from_secs(5), &mut loop_) {
            SendOutcome::Sent(h) => h,
            _ => panic!(),
        };
        assert_ne!(udp.pending(ha).unwrap().id, udp.pending(hb).unwrap().id);
    }

    #[test]
    fn exhausted_ports_enqueues_instead_of_failing() {
        let mut udp = engine(1);
        let mut loop_ = ReferenceEventLoop::new();
        let mut a = vec![0u8; 12];
        let mut b = vec![0u8; 12];
        assert!(matches!(
            udp.send_udp(1, peer(), &mut a, Duration::from_secs(5), &mut loop_),
            SendOutcome::Sent(_)
        ));
        assert!(matches!(
            udp.send_udp(2, peer(), &mut b, Duration::from_secs(5), &mut loop_),
            SendOutcome::Waiting
        ));
        assert!(!udp.wait_queue_is_empty());
    }
}
