//! Path MTU discovery.
//!
//! Probes grow by 1.25x until one goes unanswered, then binary search
//! between the largest confirmed size and the smallest failed one. Probe
//! transmission is injected as a closure so the search can be driven
//! without a socket.

use std::time::{Duration, Instant};

use crate::config::PeerConfig;
use crate::frame::PROTOCOL_MAX_MTU;

const GROWTH_FACTOR: f64 = 1.25;

/// Consecutive unanswered probes before settling.
const MAX_TIMEOUT_FAILS: u32 = 3;

const START_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuStatus {
    None,
    InProgress,
    Finished,
}

#[derive(Debug, Clone)]
pub struct MtuDiscovery {
    status: MtuStatus,
    auto_expand: bool,
    frequency: Duration,
    send_fail_limit: u32,
    current: usize,
    largest_success: usize,
    smallest_failed: Option<usize>,
    last_sent_size: usize,
    last_sent_at: Instant,
    timeout_fails: u32,
    send_fails: u32,
}

impl MtuDiscovery {
    /// The configured MTU is assumed to work; probing starts once the
    /// connection has settled for `frequency + 1.5 s + rtt`.
    pub fn new(config: &PeerConfig, now: Instant, average_rtt: Duration) -> Self {
        let current = config.maximum_transmission_unit;
        Self {
            status: MtuStatus::None,
            auto_expand: config.auto_expand_mtu,
            frequency: config.expand_mtu_frequency,
            send_fail_limit: config.expand_mtu_fail_attempts,
            current,
            largest_success: current,
            smallest_failed: None,
            last_sent_size: 0,
            last_sent_at: now + config.expand_mtu_frequency + START_DELAY + average_rtt,
            timeout_fails: 0,
            send_fails: 0,
        }
    }

    pub fn status(&self) -> MtuStatus {
        self.status
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn largest_success(&self) -> usize {
        self.largest_success
    }

    pub fn smallest_failed(&self) -> Option<usize> {
        self.smallest_failed
    }

    pub fn heartbeat(&mut self, now: Instant, probe: &mut dyn FnMut(usize) -> bool) {
        match self.status {
            MtuStatus::Finished => {}
            MtuStatus::None => {
                if !self.auto_expand {
                    self.finalize(self.current);
                    return;
                }
                if now < self.last_sent_at {
                    return;
                }
                self.expand(now, probe);
            }
            MtuStatus::InProgress => {
                if now < self.last_sent_at + self.frequency {
                    return;
                }
                self.timeout_fails += 1;
                tracing::debug!(size = self.last_sent_size, fails = self.timeout_fails, "mtu probe timed out");
                if self.timeout_fails >= MAX_TIMEOUT_FAILS {
                    self.finalize(self.current);
                    return;
                }
                self.mark_failed(self.last_sent_size);
                self.expand(now, probe);
            }
        }
    }

    /// The remote confirmed a probe of `size` bytes.
    pub fn on_success(&mut self, now: Instant, size: usize, probe: &mut dyn FnMut(usize) -> bool) {
        if size > self.largest_success {
            self.largest_success = size;
        }
        if size < self.current {
            tracing::trace!(size, current = self.current, "ignoring mtu success below current");
            return;
        }
        tracing::debug!(size, "mtu probe confirmed");
        self.current = size;
        self.timeout_fails = 0;
        self.expand(now, probe);
    }

    fn mark_failed(&mut self, size: usize) {
        if self.smallest_failed.is_none_or(|failed| size < failed) {
            self.smallest_failed = Some(size);
        }
    }

    fn next_size(&self) -> usize {
        let size = match self.smallest_failed {
            None => (self.current as f64 * GROWTH_FACTOR) as usize,
            Some(failed) => (failed + self.largest_success) / 2,
        };
        size.min(PROTOCOL_MAX_MTU)
    }

    fn expand(&mut self, now: Instant, probe: &mut dyn FnMut(usize) -> bool) {
        loop {
            let size = self.next_size();
            if size <= self.largest_success
                || self.smallest_failed.is_some_and(|failed| size >= failed)
            {
                self.finalize(self.largest_success);
                return;
            }

            self.status = MtuStatus::InProgress;
            self.last_sent_size = size;
            self.last_sent_at = now;
            if probe(size) {
                return;
            }

            self.send_fails += 1;
            tracing::debug!(size, fails = self.send_fails, "mtu probe could not be sent");
            self.mark_failed(size);
            if self.send_fails >= self.send_fail_limit {
                self.finalize(self.largest_success);
                return;
            }
        }
    }

    fn finalize(&mut self, size: usize) {
        if self.status == MtuStatus::Finished && self.current == size {
            return;
        }
        self.current = size;
        self.status = MtuStatus::Finished;
        tracing::debug!(mtu = size, "mtu discovery finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mtu: usize) -> PeerConfig {
        PeerConfig::default()
            .with_mtu(mtu)
            .with_auto_expand_mtu(true)
    }

    /// Drive discovery against a path that drops anything above `limit`.
    fn run(discovery: &mut MtuDiscovery, start: Instant, limit: usize) -> Vec<usize> {
        let mut probes = Vec::new();
        let mut now = start;
        for _ in 0..200 {
            if discovery.status() == MtuStatus::Finished {
                break;
            }
            let mut sent = None;
            discovery.heartbeat(now, &mut |size| {
                sent = Some(size);
                true
            });
            // answered probes come back before the next heartbeat
            while let Some(size) = sent.take() {
                probes.push(size);
                if size < limit {
                    discovery.on_success(now, size, &mut |next| {
                        sent = Some(next);
                        true
                    });
                }
            }
            now += Duration::from_secs(3);
        }
        probes
    }

    #[test]
    fn disabled_finalizes_at_configured_mtu() {
        let now = Instant::now();
        let mut discovery = MtuDiscovery::new(&PeerConfig::default(), now, Duration::ZERO);
        discovery.heartbeat(now, &mut |_| panic!("no probes when disabled"));
        assert_eq!(discovery.status(), MtuStatus::Finished);
        assert_eq!(discovery.current(), 1408);
    }

    #[test]
    fn waits_before_first_probe() {
        let now = Instant::now();
        let mut discovery = MtuDiscovery::new(&config(512), now, Duration::ZERO);
        discovery.heartbeat(now, &mut |_| panic!("too early"));
        assert_eq!(discovery.status(), MtuStatus::None);
    }

    #[test]
    fn converges_below_path_limit() {
        let start = Instant::now();
        let mut discovery = MtuDiscovery::new(&config(512), start, Duration::ZERO);
        let probes = run(&mut discovery, start + Duration::from_secs(10), 1500);

        assert_eq!(&probes[..4], &[640, 800, 1000, 1250]);
        assert_eq!(discovery.status(), MtuStatus::Finished);
        let mtu = discovery.current();
        assert!((1250..1500).contains(&mtu), "settled at {mtu}");
        assert!(discovery.smallest_failed().unwrap() >= 1500);
    }

    #[test]
    fn probes_clamped_to_protocol_max() {
        let start = Instant::now();
        let mut discovery = MtuDiscovery::new(&config(8000), start, Duration::ZERO);
        let probes = run(&mut discovery, start + Duration::from_secs(10), usize::MAX);
        assert_eq!(probes, vec![PROTOCOL_MAX_MTU]);
        assert_eq!(discovery.current(), PROTOCOL_MAX_MTU);
        assert_eq!(discovery.status(), MtuStatus::Finished);
    }

    #[test]
    fn repeated_timeouts_keep_current() {
        let start = Instant::now();
        let mut discovery = MtuDiscovery::new(&config(1000), start, Duration::ZERO);
        let probes = run(&mut discovery, start + Duration::from_secs(10), 0);
        assert_eq!(probes.len(), MAX_TIMEOUT_FAILS as usize);
        assert_eq!(discovery.current(), 1000);
        assert_eq!(discovery.status(), MtuStatus::Finished);
    }

    #[test]
    fn send_failures_settle_at_largest_success() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut discovery = MtuDiscovery::new(&config(512), Instant::now(), Duration::ZERO);
        let mut attempts = 0;
        discovery.heartbeat(start, &mut |_| {
            attempts += 1;
            false
        });
        assert_eq!(discovery.status(), MtuStatus::Finished);
        assert_eq!(discovery.current(), 512);
        assert!(attempts <= 5);
    }

    #[test]
    fn success_below_current_is_ignored() {
        let start = Instant::now();
        let mut discovery = MtuDiscovery::new(&config(1000), start, Duration::ZERO);
        discovery.on_success(start, 800, &mut |_| panic!("no probe for a smaller size"));
        assert_eq!(discovery.current(), 1000);
        assert_eq!(discovery.largest_success(), 1000);
        assert_eq!(discovery.status(), MtuStatus::None);
    }

    #[test]
    fn late_success_reopens_probing() {
        let start = Instant::now();
        let mut discovery = MtuDiscovery::new(&config(1000), start, Duration::ZERO);
        let now = start + Duration::from_secs(10);
        let probes = run(&mut discovery, now, 0);
        assert_eq!(discovery.status(), MtuStatus::Finished);
        assert_eq!(discovery.current(), 1000);

        // the last probe was answered after all
        let answered = probes[2];
        let mut next = None;
        discovery.on_success(now, answered, &mut |size| {
            next = Some(size);
            true
        });
        assert_eq!(discovery.current(), answered);
        assert_eq!(discovery.status(), MtuStatus::InProgress);
        assert_eq!(next, Some((probes[1] + answered) / 2));
    }
}
