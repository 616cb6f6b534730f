use std::time::{Duration, Instant};

/// What the connection should do when the keepalive deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveTick {
    /// Send a KEEPALIVE with the respond flag.
    Send,
    /// The previous KEEPALIVE was never answered.
    TimedOut,
}

/// Deadline-driven keepalive state for the initiator.
///
/// The owner polls with the current time; nothing runs in the background, so a
/// stopped timer can never fire late.
#[derive(Debug, Clone)]
pub struct KeepaliveTimer {
    period: Duration,
    pending: bool,
    deadline: Option<Instant>,
}

impl KeepaliveTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            pending: false,
            deadline: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Start ticking. A running timer keeps its schedule.
    pub fn start(&mut self, now: Instant) {
        if self.deadline.is_some() {
            return;
        }
        self.pending = false;
        self.deadline = Some(now + self.period);
    }

    pub fn stop(&mut self) {
        self.pending = false;
        self.deadline = None;
    }

    /// A KEEPALIVE answer arrived.
    pub fn keepalive_received(&mut self) {
        self.pending = false;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Advance the timer; `None` until the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<KeepaliveTick> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        if self.pending {
            self.stop();
            return Some(KeepaliveTick::TimedOut);
        }
        self.pending = true;
        self.deadline = Some(now + self.period);
        Some(KeepaliveTick::Send)
    }
}
