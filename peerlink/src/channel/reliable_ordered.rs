//! Reliable-ordered receiver: in-order delivery over a withholding window.
//!
//! Early messages wait in slot `seq % W` until the gap before them closes;
//! the release then cascades through every contiguous withheld message.

use crate::channel::{ack_for, Ack, Delivery, DropReason, ReceiverChannel};
use crate::message::IncomingMessage;
use crate::sequence::{self, SequenceBits};

pub struct ReliableOrderedReceiver {
    window_size: usize,
    window_start: u16,
    withheld: Vec<Option<IncomingMessage>>,
    early_received: SequenceBits,
}

impl ReliableOrderedReceiver {
    pub fn new(window_size: usize) -> Self {
        debug_assert!(sequence::is_valid_window_size(window_size));
        Self {
            window_size,
            window_start: 0,
            withheld: (0..window_size).map(|_| None).collect(),
            early_received: SequenceBits::new(window_size),
        }
    }

    /// Messages currently held back waiting for a gap to fill.
    pub fn withheld_count(&self) -> usize {
        self.early_received.count_ones()
    }

    fn advance_window(&mut self) {
        self.early_received.set(self.window_start as usize, false);
        self.window_start = sequence::advance(self.window_start, 1);
    }
}

impl ReceiverChannel for ReliableOrderedReceiver {
    fn receive(&mut self, message: IncomingMessage, acks: &mut Vec<Ack>) -> Delivery {
        acks.push(ack_for(&message));
        let seq = message.sequence();
        let relate = sequence::relative_sequence_number(seq, self.window_start);

        if relate == 0 {
            let mut released = vec![message];
            self.advance_window();

            while self.early_received.get(self.window_start as usize) {
                let slot = self.window_start as usize % self.window_size;
                match self.withheld[slot].take() {
                    Some(next) => released.push(next),
                    None => {
                        debug_assert!(false, "early bit set for empty slot {slot}");
                        tracing::error!(slot, "withheld slot empty despite early mark");
                    }
                }
                self.advance_window();
            }
            return Delivery::Released(released);
        }

        if relate < 0 {
            tracing::trace!(seq, window_start = self.window_start, "dropping late or duplicate");
            return Delivery::Dropped(DropReason::LateOrDuplicate);
        }

        // relate == window_size would land in the on-time slot
        if relate as usize >= self.window_size {
            tracing::debug!(seq, window_start = self.window_start, "dropping too early message");
            return Delivery::Dropped(DropReason::TooEarly);
        }

        if self.early_received.get(seq as usize) {
            return Delivery::Dropped(DropReason::LateOrDuplicate);
        }
        self.early_received.set(seq as usize, true);
        self.withheld[seq as usize % self.window_size] = Some(message);
        Delivery::Withheld
    }

    fn window_start(&self) -> u16 {
        self.window_start
    }
}
