//! Ping/pong round-trip estimation.
//!
//! avg = 0.7 * avg + 0.3 * sample, seeded by the first sample. The reliable
//! resend delay is derived from the average.

use std::time::{Duration, Instant};

const DEFAULT_RTT: Duration = Duration::from_millis(100);
const RESEND_BASE: Duration = Duration::from_millis(25);
const RESEND_RTT_FACTOR: f64 = 2.1;

#[derive(Debug, Clone)]
pub(crate) struct Latency {
    sent_ping_number: u8,
    sent_ping_time: Option<Instant>,
    next_ping_at: Instant,
    average_rtt: Option<Duration>,
    remote_time_offset: f64,
}

impl Latency {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            sent_ping_number: 0,
            sent_ping_time: None,
            next_ping_at: now,
            average_rtt: None,
            remote_time_offset: 0.0,
        }
    }

    /// Schedule the second ping at a random point of the first interval so
    /// connections made at the same moment do not ping in lockstep.
    pub(crate) fn initialize(&mut self, now: Instant, ping_interval: Duration) {
        let jitter = 0.25 + 0.75 * rand::random::<f64>();
        self.next_ping_at = now + ping_interval.mul_f64(jitter);
    }

    pub(crate) fn ping_due(&self, now: Instant) -> bool {
        now >= self.next_ping_at
    }

    /// Record a ping going out; returns its number.
    pub(crate) fn next_ping(&mut self, now: Instant, ping_interval: Duration) -> u8 {
        self.sent_ping_number = self.sent_ping_number.wrapping_add(1);
        self.sent_ping_time = Some(now);
        if self.next_ping_at <= now {
            self.next_ping_at = now + ping_interval;
        }
        self.sent_ping_number
    }

    /// Apply a pong; returns the new sample unless the pong is stale.
    pub(crate) fn on_pong(
        &mut self,
        now: Instant,
        number: u8,
        remote_seconds: f32,
        local_seconds: f32,
    ) -> Option<Duration> {
        if number != self.sent_ping_number {
            return None;
        }
        let sent = self.sent_ping_time.take()?;
        let rtt = now.saturating_duration_since(sent);

        // remote clock read at about half the round trip
        let remote_now = remote_seconds as f64 + rtt.as_secs_f64() / 2.0;
        self.remote_time_offset = remote_now - local_seconds as f64;

        let average = match self.average_rtt {
            None => rtt,
            Some(avg) => avg.mul_f64(0.7) + rtt.mul_f64(0.3),
        };
        self.average_rtt = Some(average);
        Some(rtt)
    }

    pub(crate) fn set_remote_time(&mut self, remote_seconds: f32, local_seconds: f32) {
        self.remote_time_offset = remote_seconds as f64 - local_seconds as f64;
    }

    pub(crate) fn average_rtt(&self) -> Option<Duration> {
        self.average_rtt
    }

    pub(crate) fn remote_time_offset(&self) -> f64 {
        self.remote_time_offset
    }

    pub(crate) fn resend_delay(&self) -> Duration {
        let rtt = self.average_rtt.unwrap_or(DEFAULT_RTT);
        RESEND_BASE + rtt.mul_f64(RESEND_RTT_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resend_delay() {
        let latency = Latency::new(Instant::now());
        assert_eq!(latency.resend_delay(), Duration::from_millis(235));
    }

    #[test]
    fn first_sample_seeds_then_smooths() {
        let start = Instant::now();
        let mut latency = Latency::new(start);
        let n = latency.next_ping(start, Duration::from_secs(4));
        let rtt = latency
            .on_pong(start + Duration::from_millis(100), n, 0.0, 0.0)
            .unwrap();
        assert_eq!(rtt, Duration::from_millis(100));
        assert_eq!(latency.average_rtt(), Some(Duration::from_millis(100)));

        let t = start + Duration::from_secs(1);
        let n = latency.next_ping(t, Duration::from_secs(4));
        latency.on_pong(t + Duration::from_millis(200), n, 0.0, 0.0);
        let avg = latency.average_rtt().unwrap();
        assert!((avg.as_secs_f64() - 0.13).abs() < 1e-6);
    }

    #[test]
    fn stale_pong_ignored() {
        let start = Instant::now();
        let mut latency = Latency::new(start);
        let first = latency.next_ping(start, Duration::from_secs(4));
        latency.next_ping(start, Duration::from_secs(4));
        assert!(latency.on_pong(start, first, 0.0, 0.0).is_none());
        assert!(latency.average_rtt().is_none());
    }

    #[test]
    fn initial_ping_is_jittered_within_interval() {
        let start = Instant::now();
        let interval = Duration::from_secs(4);
        let mut latency = Latency::new(start);
        latency.initialize(start, interval);
        assert!(!latency.ping_due(start));
        assert!(latency.ping_due(start + interval));
    }
}
