//! Unreliable channels: fire-and-forget sender, unordered and sequenced receivers.
//!
//! The sender keeps the reliable sender's window arithmetic for flow
//! control but stores nothing; a frame carries the queue's recycle
//! reference straight to the encoder.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{ack_for, Ack, Delivery, DropReason, OutgoingFrame, ReceiverChannel, SenderChannel};
use crate::message::{IncomingMessage, QueuedMessage, SendResult};
use crate::pool::MessagePool;
use crate::sequence;

/// A full window with no ack for this many resend delays is written off:
/// unreliable messages are never resent, so their acks may never come.
const WINDOW_EXPIRY_FACTOR: u32 = 10;

pub struct UnreliableSender {
    window_size: usize,
    window_start: u16,
    send_start: u16,
    flow_control: bool,
    drop_above_mtu: bool,
    queued: VecDeque<Arc<QueuedMessage>>,
    last_progress: Option<Instant>,
}

impl UnreliableSender {
    pub fn new(window_size: usize, flow_control: bool, drop_above_mtu: bool) -> Self {
        Self {
            window_size,
            window_start: 0,
            send_start: 0,
            flow_control,
            drop_above_mtu,
            queued: VecDeque::new(),
            last_progress: None,
        }
    }

    pub fn window_start(&self) -> u16 {
        self.window_start
    }

    fn expire_stalled_window(&mut self, now: Instant, resend_delay: Duration) {
        if !self.flow_control || self.allowed_sends() > 0 {
            return;
        }
        let Some(since) = self.last_progress else {
            return;
        };
        if now.saturating_duration_since(since) > resend_delay * WINDOW_EXPIRY_FACTOR {
            tracing::debug!(
                window_start = self.window_start,
                send_start = self.send_start,
                "unreliable window expired without acks"
            );
            self.window_start = self.send_start;
            self.last_progress = Some(now);
        }
    }
}

impl SenderChannel for UnreliableSender {
    fn window_size(&self) -> usize {
        self.window_size
    }

    fn allowed_sends(&self) -> usize {
        if !self.flow_control {
            return usize::MAX;
        }
        self.window_size
            .saturating_sub(sequence::distance(self.window_start, self.send_start))
    }

    fn queued_sends(&self) -> usize {
        self.queued.len()
    }

    fn enqueue(&mut self, message: Arc<QueuedMessage>, current_mtu: usize, pool: &MessagePool) -> SendResult {
        if self.drop_above_mtu && message.encoded_len() > current_mtu {
            tracing::debug!(len = message.encoded_len(), current_mtu, "dropping unreliable message above MTU");
            pool.release(message);
            return SendResult::Dropped;
        }
        if self.queued.len() + 1 > self.allowed_sends() {
            tracing::trace!(queued = self.queued.len(), "unreliable window full, dropping");
            pool.release(message);
            return SendResult::Dropped;
        }
        self.queued.push_back(message);
        SendResult::Sent
    }

    fn send_queued_messages(&mut self, now: Instant, resend_delay: Duration, out: &mut Vec<OutgoingFrame>) {
        self.expire_stalled_window(now, resend_delay);

        while self.allowed_sends() > 0 {
            let Some(message) = self.queued.pop_front() else {
                break;
            };
            let seq = self.send_start;
            self.send_start = sequence::advance(seq, 1);
            if self.last_progress.is_none() {
                self.last_progress = Some(now);
            }
            out.push(OutgoingFrame {
                message,
                sequence: seq,
                resend: None,
            });
        }
    }

    fn receive_acknowledge(
        &mut self,
        now: Instant,
        seq: u16,
        _resend_delay: Duration,
        _pool: &MessagePool,
        _out: &mut Vec<OutgoingFrame>,
    ) -> bool {
        if !self.flow_control {
            tracing::warn!(seq, "ack on a channel with suppressed acks; sender/receiver configuration mismatch");
            return false;
        }
        let relate = sequence::relative_sequence_number(seq, self.window_start);
        if relate < 0 {
            return false;
        }
        if relate > 0 && sequence::relative_sequence_number(seq, self.send_start) >= 0 {
            tracing::warn!(seq, send_start = self.send_start, "ack for a message not yet sent");
            return false;
        }
        // Anything before an acked unreliable message is either in or lost.
        self.window_start = sequence::advance(seq, 1);
        self.last_progress = Some(now);
        false
    }

    fn need_to_send_messages(&self) -> bool {
        !self.queued.is_empty()
    }

    fn reset(&mut self, pool: &MessagePool) {
        for message in self.queued.drain(..) {
            pool.release(message);
        }
        self.window_start = 0;
        self.send_start = 0;
        self.last_progress = None;
    }
}

/// Releases everything; acks only when the sender expects them.
pub struct UnreliableUnorderedReceiver {
    flow_control: bool,
}

impl UnreliableUnorderedReceiver {
    pub fn new(flow_control: bool) -> Self {
        Self { flow_control }
    }
}

impl ReceiverChannel for UnreliableUnorderedReceiver {
    fn receive(&mut self, message: IncomingMessage, acks: &mut Vec<Ack>) -> Delivery {
        if self.flow_control {
            acks.push(ack_for(&message));
        }
        Delivery::Released(vec![message])
    }

    fn window_start(&self) -> u16 {
        0
    }
}

/// Releases only messages newer than the last one released.
pub struct UnreliableSequencedReceiver {
    expected: u16,
}

impl UnreliableSequencedReceiver {
    pub fn new() -> Self {
        Self { expected: 0 }
    }
}

impl Default for UnreliableSequencedReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverChannel for UnreliableSequencedReceiver {
    fn receive(&mut self, message: IncomingMessage, acks: &mut Vec<Ack>) -> Delivery {
        acks.push(ack_for(&message));
        let seq = message.sequence();
        if sequence::relative_sequence_number(seq, self.expected) < 0 {
            tracing::trace!(seq, expected = self.expected, "dropping stale sequenced message");
            return Delivery::Dropped(DropReason::LateOrDuplicate);
        }
        self.expected = sequence::advance(seq, 1);
        Delivery::Released(vec![message])
    }

    fn window_start(&self) -> u16 {
        self.expected
    }
}
