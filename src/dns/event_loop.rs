//! The event-loop collaborator (§1, §5): one-shot timers and comm-point
//! readiness. This crate defines the trait seam plus a minimal reference
//! implementation sufficient to drive the engine standalone and in
//! tests; a production embedder binds these traits to its own reactor
//! (tokio, mio, ...) instead.

use std::time::{Duration, Instant};

use crate::dns::slab::{Handle, Slab};

/// One-shot timer: arming replaces any previously armed deadline: "every
/// timer fire is an independent event-loop turn" (§5).
pub trait Timer {
    fn arm(&mut self, after: Duration);
    fn disarm(&mut self);
}

/// Comm-point readiness, as seen by a socket's owner between event-loop
/// turns. Kept intentionally thin: the reference event loop below polls
/// non-blocking sockets directly rather than routing bytes through this
/// trait, since a production embedder's own reactor already owns that.
pub trait CommPoint {
    fn is_readable(&self) -> bool;
    fn is_writable(&self) -> bool;
}

pub trait EventLoop {
    fn now(&self) -> Instant;
    fn create_timer(&mut self) -> Handle;
    fn arm_timer(&mut self, timer: Handle, after: Duration);
    fn disarm_timer(&mut self, timer: Handle);
    fn drop_timer(&mut self, timer: Handle);
    /// Pops timers that have fired since the last call. Each returned
    /// handle is disarmed as part of being reported.
    fn take_fired(&mut self) -> Vec<Handle>;
}

struct TimerSlot {
    deadline: Option<Instant>,
}

/// Minimal poll-based reference event loop. "Poll-based" here means what
/// it says: [`crate::dns::engine::Engine::tick`] polls non-blocking
/// sockets directly on every turn and calls `take_fired` to collect due
/// timers — there is no internal epoll/kqueue registration, which is
/// exactly the tradeoff that makes this suitable for tests and a
/// from-scratch embedder, not for a high-throughput production server.
pub struct ReferenceEventLoop {
    timers: Slab<TimerSlot>,
}

impl ReferenceEventLoop {
    pub fn new() -> Self {
        ReferenceEventLoop { timers: Slab::new() }
    }
}

impl Default for ReferenceEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for ReferenceEventLoop {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn create_timer(&mut self) -> Handle {
        self.timers.insert(TimerSlot { deadline: None })
    }

    fn arm_timer(&mut self, timer: Handle, after: Duration) {
        if let Some(slot) = self.timers.get_mut(timer) {
            slot.deadline = Some(Instant::now() + after);
        }
    }

    fn disarm_timer(&mut self, timer: Handle) {
        if let Some(slot) = self.timers.get_mut(timer) {
            slot.deadline = None;
        }
    }

    fn drop_timer(&mut self, timer: Handle) {
        self.timers.remove(timer);
    }

    fn take_fired(&mut self) -> Vec<Handle> {
        let now = Instant::now();
        let mut fired = Vec::new();
        for (handle, slot) in self.timers.iter_mut() {
            if slot.deadline.map(|d| now >= d).unwrap_or(false) {
                slot.deadline = None;
                fired.push(handle);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn timer_fires_after_its_deadline_and_not_before() {
        let mut loop_ = ReferenceEventLoop::new();
        let timer = loop_.create_timer();
        loop_.arm_timer(timer, Duration::from_millis(20));
        assert!(loop_.take_fired().is_empty());
        sleep(Duration::from_millis(30));
        assert_eq!(loop_.take_fired(), vec![timer]);
        // One-shot: a second poll without rearming reports nothing.
        assert!(loop_.take_fired().is_empty());
    }

    #[test]
    fn disarm_prevents_a_pending_timer_from_firing() {
        let mut loop_ = ReferenceEventLoop::new();
        let timer = loop_.create_timer();
        loop_.arm_timer(timer, Duration::from_millis(5));
        loop_.disarm_timer(timer);
        sleep(Duration::from_millis(15));
        assert!(loop_.take_fired().is_empty());
    }
}
