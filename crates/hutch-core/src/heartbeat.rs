//! Heartbeat scheduling.
//!
//! Once a connection is established, the client must emit a heartbeat frame
//! whenever the negotiated interval elapses without any other outbound
//! traffic — every outbound write resets the timer. Inbound heartbeats are
//! not handled here: the dispatch layer echoes them immediately on receipt.
//!
//! Pure like the other machines: time comes in as parameters, the schedule
//! never reads a clock.

use std::time::{Duration, Instant};

use hutch_proto::Frame;

/// Outbound heartbeat schedule for one connection.
#[derive(Debug, Clone)]
pub struct Heartbeats {
    interval: Option<Duration>,
    last_outbound: Instant,
}

impl Heartbeats {
    /// Arm the schedule with the negotiated interval in seconds; 0 disables
    /// heartbeats entirely.
    #[must_use]
    pub fn new(interval_secs: u16, now: Instant) -> Self {
        let interval =
            (interval_secs > 0).then(|| Duration::from_secs(u64::from(interval_secs)));
        Self { interval, last_outbound: now }
    }

    /// True when the negotiated interval disables heartbeats.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.interval.is_none()
    }

    /// Record any outbound write; it counts as liveness and resets the
    /// timer.
    pub fn record_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    /// When the next heartbeat is due, if ever.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.interval.map(|interval| self.last_outbound + interval)
    }

    /// Emit a heartbeat frame when the interval has elapsed.
    ///
    /// The emitted frame is itself an outbound write, so it resets the
    /// timer.
    pub fn tick(&mut self, now: Instant) -> Option<Frame> {
        let interval = self.interval?;
        if now.duration_since(self.last_outbound) >= interval {
            self.last_outbound = now;
            Some(Frame::heartbeat())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_after_the_interval() {
        let t0 = Instant::now();
        let mut hb = Heartbeats::new(20, t0);

        assert!(hb.tick(t0).is_none());
        assert!(hb.tick(t0 + Duration::from_secs(19)).is_none());
        assert!(hb.tick(t0 + Duration::from_secs(20)).is_some());
    }

    #[test]
    fn emitting_resets_the_timer() {
        let t0 = Instant::now();
        let mut hb = Heartbeats::new(20, t0);

        let t1 = t0 + Duration::from_secs(25);
        assert!(hb.tick(t1).is_some());
        // Too soon again relative to the emission.
        assert!(hb.tick(t1 + Duration::from_secs(10)).is_none());
        assert!(hb.tick(t1 + Duration::from_secs(20)).is_some());
    }

    #[test]
    fn outbound_traffic_defers_the_heartbeat() {
        let t0 = Instant::now();
        let mut hb = Heartbeats::new(20, t0);

        // A publish at t+15 pushes the deadline out.
        hb.record_outbound(t0 + Duration::from_secs(15));
        assert!(hb.tick(t0 + Duration::from_secs(20)).is_none());
        assert!(hb.tick(t0 + Duration::from_secs(35)).is_some());
    }

    #[test]
    fn zero_interval_disables_the_schedule() {
        let t0 = Instant::now();
        let mut hb = Heartbeats::new(0, t0);
        assert!(hb.is_disabled());
        assert_eq!(hb.next_deadline(), None);
        assert!(hb.tick(t0 + Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn deadline_tracks_last_outbound() {
        let t0 = Instant::now();
        let mut hb = Heartbeats::new(5, t0);
        assert_eq!(hb.next_deadline(), Some(t0 + Duration::from_secs(5)));

        let t1 = t0 + Duration::from_secs(2);
        hb.record_outbound(t1);
        assert_eq!(hb.next_deadline(), Some(t1 + Duration::from_secs(5)));
    }
}
