//! Traffic counters for a peer and for each of its connections.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::ResendReason;

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

#[derive(Debug, Default)]
pub struct PeerStatistics {
    sent_packets: AtomicU64,
    received_packets: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    received_fragments: AtomicU64,
    malformed_packets: AtomicU64,
}

/// Point-in-time copy of [`PeerStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatsSnapshot {
    pub sent_packets: u64,
    pub received_packets: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub sent_messages: u64,
    pub received_messages: u64,
    pub received_fragments: u64,
    pub malformed_packets: u64,
}

impl PeerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn packet_sent(&self, bytes: usize, messages: usize) {
        bump(&self.sent_packets, 1);
        bump(&self.sent_bytes, bytes as u64);
        bump(&self.sent_messages, messages as u64);
    }

    pub(crate) fn packet_received(&self, bytes: usize) {
        bump(&self.received_packets, 1);
        bump(&self.received_bytes, bytes as u64);
    }

    pub(crate) fn message_received(&self, is_fragment: bool) {
        bump(&self.received_messages, 1);
        if is_fragment {
            bump(&self.received_fragments, 1);
        }
    }

    pub(crate) fn malformed_packet(&self) {
        bump(&self.malformed_packets, 1);
    }

    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_fragments: self.received_fragments.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionStatistics {
    sent_packets: AtomicU64,
    received_packets: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    resent_delay: AtomicU64,
    resent_hole: AtomicU64,
    dropped_messages: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub sent_packets: u64,
    pub received_packets: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub sent_messages: u64,
    pub received_messages: u64,
    pub resent_messages_delay: u64,
    pub resent_messages_hole: u64,
    pub dropped_messages: u64,
}

impl ConnectionStatsSnapshot {
    pub fn resent_messages(&self) -> u64 {
        self.resent_messages_delay + self.resent_messages_hole
    }
}

impl ConnectionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn packet_sent(&self, bytes: usize, messages: usize) {
        bump(&self.sent_packets, 1);
        bump(&self.sent_bytes, bytes as u64);
        bump(&self.sent_messages, messages as u64);
    }

    pub(crate) fn packet_received(&self, bytes: usize) {
        bump(&self.received_packets, 1);
        bump(&self.received_bytes, bytes as u64);
    }

    pub(crate) fn message_received(&self) {
        bump(&self.received_messages, 1);
    }

    pub(crate) fn message_resent(&self, reason: ResendReason) {
        match reason {
            ResendReason::Delay => bump(&self.resent_delay, 1),
            ResendReason::HoleInSequence => bump(&self.resent_hole, 1),
        }
    }

    pub(crate) fn message_dropped(&self) {
        bump(&self.dropped_messages, 1);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            resent_messages_delay: self.resent_delay.load(Ordering::Relaxed),
            resent_messages_hole: self.resent_hole.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}
