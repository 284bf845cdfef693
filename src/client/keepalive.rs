use std::time::Duration;

use quanta::Instant;

use crate::protocol::{Message, keepalive};

/// What the event loop must do after checking the keepalive deadline.
#[derive(Debug)]
pub(crate) enum Trigger {
    /// Nothing due yet.
    Idle,
    /// The peer was silent for another interval: send this ping.
    Ping(Message),
    /// Too many silent intervals: the connection is dead.
    Dead,
}

/// Liveness tracking for one connection.
///
/// Any inbound frame resets the countdown. Each interval elapsed in silence
/// is a miss; a ping goes out on every miss but the last, and reaching
/// `count` misses declares the peer dead.
///
/// ```text
///   last frame        +interval        +2·interval   ...   +count·interval
///       │                 │                  │                    │
///       └─── silence ─────┴─► PING ──────────┴─► PING ── ... ─────┴─► dead
/// ```
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Duration,
    count: u32,
    missed: u32,
    last: Instant,
    enabled: bool,
}

impl KeepAlive {
    pub(crate) fn new() -> Self {
        Self {
            interval: Duration::ZERO,
            count: 0,
            missed: 0,
            last: Instant::now(),
            enabled: false,
        }
    }

    pub(crate) fn start(&mut self, interval: Duration, count: u32, now: Instant) {
        self.interval = interval;
        self.count = count.max(1);
        self.missed = 0;
        self.last = now;
        self.enabled = !interval.is_zero();
    }

    pub(crate) fn stop(&mut self) {
        self.enabled = false;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `None` when disabled, or when the deadline lies beyond what the clock
    /// can represent.
    fn deadline(&self) -> Option<Instant> {
        if !self.enabled {
            return None;
        }
        let wait = self.interval.checked_mul(self.missed.checked_add(1)?)?;
        self.last.checked_add(wait)
    }

    /// How long the event loop may sleep before the next check.
    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(now))
    }

    /// Records inbound traffic.
    pub(crate) fn received(&mut self, now: Instant) {
        self.last = now;
        self.missed = 0;
    }

    pub(crate) fn trigger(&mut self, now: Instant) -> Trigger {
        match self.deadline() {
            Some(deadline) if now >= deadline => {}
            _ => return Trigger::Idle,
        }
        self.missed += 1;
        if self.missed >= self.count {
            self.enabled = false;
            return Trigger::Dead;
        }
        Trigger::Ping(keepalive::ping())
    }

    pub(crate) fn missed(&self) -> u32 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::keepalive::{Keepalive, classify};

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn keepalive_disabled() {
        let now = Instant::now();
        let mut ka = KeepAlive::new();
        assert!(!ka.is_enabled());
        assert_eq!(ka.timeout(now), None);
        assert!(matches!(ka.trigger(now + 100 * SEC), Trigger::Idle));

        // A zero interval does not enable anything
        ka.start(Duration::ZERO, 3, now);
        assert!(!ka.is_enabled());
    }

    #[test]
    fn keepalive_countdown() {
        let t0 = Instant::now();
        let mut ka = KeepAlive::new();
        ka.start(SEC, 3, t0);
        assert_eq!(ka.timeout(t0), Some(SEC));

        // 1. Not due yet
        assert!(matches!(ka.trigger(t0 + SEC / 2), Trigger::Idle));

        // 2. First and second misses send a ping
        match ka.trigger(t0 + SEC) {
            Trigger::Ping(msg) => assert_eq!(classify(&msg.header), Some(Keepalive::Ping)),
            t => panic!("unexpected {t:?}"),
        }
        assert_eq!(ka.timeout(t0 + SEC), Some(SEC));
        assert!(matches!(ka.trigger(t0 + 2 * SEC), Trigger::Ping(_)));
        assert_eq!(ka.missed(), 2);

        // 3. Third miss is fatal
        assert!(matches!(ka.trigger(t0 + 3 * SEC), Trigger::Dead));
        assert!(!ka.is_enabled());
    }

    #[test]
    fn keepalive_reset() {
        let t0 = Instant::now();
        let mut ka = KeepAlive::new();
        ka.start(SEC, 2, t0);

        assert!(matches!(ka.trigger(t0 + SEC), Trigger::Ping(_)));
        // Any frame counts as an answer
        ka.received(t0 + SEC + SEC / 2);
        assert_eq!(ka.missed(), 0);
        assert!(matches!(ka.trigger(t0 + 2 * SEC), Trigger::Idle));
        assert!(matches!(ka.trigger(t0 + 2 * SEC + SEC / 2), Trigger::Ping(_)));
        assert!(matches!(ka.trigger(t0 + 3 * SEC + SEC / 2), Trigger::Dead));
    }

    #[test]
    fn keepalive_huge_interval() {
        let t0 = Instant::now();
        let mut ka = KeepAlive::new();

        // A deadline past the end of the clock never fires
        ka.start(Duration::MAX, 1, t0);
        assert!(ka.is_enabled());
        assert_eq!(ka.timeout(t0), None);
        assert!(matches!(ka.trigger(t0 + 1000 * SEC), Trigger::Idle));

        // Same once the miss count multiplies the interval out of range
        ka.start(Duration::from_secs(u64::MAX / 2), 3, t0);
        ka.missed = 2;
        assert_eq!(ka.timeout(t0), None);
        assert!(matches!(ka.trigger(t0 + SEC), Trigger::Idle));
        assert_eq!(ka.missed(), 2);
    }
}
