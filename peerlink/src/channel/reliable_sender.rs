//! Reliable sender: selective-repeat ARQ over a fixed window.
//!
//! Every sent message stays in slot `seq % W` until acknowledged. Stored
//! messages are resent when older than the resend delay, or right away when a
//! later sequence number is acknowledged first (a likely hole).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{OutgoingFrame, ResendReason, SenderChannel};
use crate::message::{QueuedMessage, SendResult};
use crate::pool::MessagePool;
use crate::sequence::{self, SequenceBits, NUM_SEQUENCE_NUMBERS};

/// An ack this soon after the first send resets the connection timeout.
const LIVENESS_ACK_WINDOW: Duration = Duration::from_secs(2);

/// Hole resends are skipped for messages sent within this share of the delay.
const HOLE_RESEND_FACTOR: f64 = 0.35;

struct StoredMessage {
    message: Arc<QueuedMessage>,
    sequence: u16,
    num_sent: u32,
    last_sent: Instant,
}

pub struct ReliableSender {
    window_size: usize,
    window_start: u16,
    send_start: u16,
    stored: Vec<Option<StoredMessage>>,
    received_acks: SequenceBits,
    queued: VecDeque<Arc<QueuedMessage>>,
}

impl ReliableSender {
    pub fn new(window_size: usize) -> Self {
        debug_assert!(sequence::is_valid_window_size(window_size));
        Self {
            window_size,
            window_start: 0,
            send_start: 0,
            stored: (0..window_size).map(|_| None).collect(),
            received_acks: SequenceBits::new(NUM_SEQUENCE_NUMBERS as usize),
            queued: VecDeque::new(),
        }
    }

    pub fn window_start(&self) -> u16 {
        self.window_start
    }

    pub fn send_start(&self) -> u16 {
        self.send_start
    }

    fn execute_send(&mut self, now: Instant, message: Arc<QueuedMessage>, out: &mut Vec<OutgoingFrame>) {
        let seq = self.send_start;
        self.send_start = sequence::advance(seq, 1);
        let slot = seq as usize % self.window_size;

        if let Some(old) = self.stored[slot].take() {
            debug_assert!(false, "window slot {slot} still occupied by {}", old.sequence);
            tracing::error!(slot, stale = old.sequence, "overwriting occupied window slot");
        }

        message.retain();
        out.push(OutgoingFrame {
            message: message.clone(),
            sequence: seq,
            resend: None,
        });
        self.stored[slot] = Some(StoredMessage {
            message,
            sequence: seq,
            num_sent: 1,
            last_sent: now,
        });
    }

    fn destore(&mut self, now: Instant, slot: usize, pool: &MessagePool) -> bool {
        match self.stored[slot].take() {
            Some(stored) => {
                let fresh = stored.num_sent == 1
                    && now.saturating_duration_since(stored.last_sent) < LIVENESS_ACK_WINDOW;
                pool.release(stored.message);
                fresh
            }
            None => false,
        }
    }

    fn resend(stored: &mut StoredMessage, now: Instant, reason: ResendReason, out: &mut Vec<OutgoingFrame>) {
        stored.num_sent += 1;
        stored.last_sent = now;
        stored.message.retain();
        out.push(OutgoingFrame {
            message: stored.message.clone(),
            sequence: stored.sequence,
            resend: Some(reason),
        });
    }
}

impl SenderChannel for ReliableSender {
    fn window_size(&self) -> usize {
        self.window_size
    }

    fn allowed_sends(&self) -> usize {
        self.window_size
            .saturating_sub(sequence::distance(self.window_start, self.send_start))
    }

    fn queued_sends(&self) -> usize {
        self.queued.len()
    }

    fn stored_messages(&self) -> usize {
        self.stored.iter().filter(|s| s.is_some()).count()
    }

    fn enqueue(&mut self, message: Arc<QueuedMessage>, _current_mtu: usize, _pool: &MessagePool) -> SendResult {
        self.queued.push_back(message);
        if self.queued.len() <= self.allowed_sends() {
            SendResult::Sent
        } else {
            SendResult::Queued
        }
    }

    fn send_queued_messages(&mut self, now: Instant, resend_delay: Duration, out: &mut Vec<OutgoingFrame>) {
        for stored in self.stored.iter_mut().flatten() {
            // acked early, waiting for the window to catch up
            if self.received_acks.get(stored.sequence as usize) {
                continue;
            }
            if now.saturating_duration_since(stored.last_sent) > resend_delay {
                Self::resend(stored, now, ResendReason::Delay, out);
            }
        }

        while self.allowed_sends() > 0 {
            let Some(message) = self.queued.pop_front() else {
                break;
            };
            self.execute_send(now, message, out);
        }
    }

    fn receive_acknowledge(
        &mut self,
        now: Instant,
        seq: u16,
        resend_delay: Duration,
        pool: &MessagePool,
        out: &mut Vec<OutgoingFrame>,
    ) -> bool {
        let relate = sequence::relative_sequence_number(seq, self.window_start);
        if relate < 0 {
            tracing::trace!(seq, window_start = self.window_start, "late or duplicate ack");
            return false;
        }

        if relate == 0 {
            self.received_acks.set(self.window_start as usize, false);
            let slot = self.window_start as usize % self.window_size;
            let mut fresh = self.destore(now, slot, pool);
            self.window_start = sequence::advance(self.window_start, 1);

            while self.received_acks.get(self.window_start as usize) {
                self.received_acks.set(self.window_start as usize, false);
                let slot = self.window_start as usize % self.window_size;
                fresh |= self.destore(now, slot, pool);
                self.window_start = sequence::advance(self.window_start, 1);
            }
            return fresh;
        }

        if sequence::relative_sequence_number(seq, self.send_start) >= 0 {
            tracing::warn!(seq, send_start = self.send_start, "ack for a message not yet sent");
            return false;
        }
        if self.received_acks.get(seq as usize) {
            return false;
        }
        self.received_acks.set(seq as usize, true);

        let min_interval = resend_delay.mul_f64(HOLE_RESEND_FACTOR);
        let mut rnr = seq;
        while rnr != self.window_start {
            rnr = sequence::advance(rnr, NUM_SEQUENCE_NUMBERS as usize - 1);
            if self.received_acks.get(rnr as usize) {
                continue;
            }
            let slot = rnr as usize % self.window_size;
            if let Some(stored) = self.stored[slot].as_mut() {
                if stored.num_sent == 1
                    && now.saturating_duration_since(stored.last_sent) >= min_interval
                {
                    Self::resend(stored, now, ResendReason::HoleInSequence, out);
                }
            }
        }
        false
    }

    fn need_to_send_messages(&self) -> bool {
        !self.queued.is_empty() || self.stored.iter().any(|s| s.is_some())
    }

    fn reset(&mut self, pool: &MessagePool) {
        for stored in self.stored.iter_mut() {
            if let Some(stored) = stored.take() {
                pool.release(stored.message);
            }
        }
        for message in self.queued.drain(..) {
            pool.release(message);
        }
        self.received_acks.clear();
        self.window_start = 0;
        self.send_start = 0;
    }
}
