//! Reliable-unordered receiver.
//!
//! Every new message is released at once. Early arrivals are remembered so
//! that a resend of one of them is recognised as a duplicate once the window
//! reaches it.

use crate::channel::{ack_for, Ack, Delivery, DropReason, ReceiverChannel};
use crate::message::IncomingMessage;
use crate::sequence::{self, SequenceBits};

pub struct ReliableUnorderedReceiver {
    window_size: usize,
    window_start: u16,
    early_received: SequenceBits,
}

impl ReliableUnorderedReceiver {
    pub fn new(window_size: usize) -> Self {
        debug_assert!(sequence::is_valid_window_size(window_size));
        Self {
            window_size,
            window_start: 0,
            early_received: SequenceBits::new(window_size),
        }
    }

    fn advance_window(&mut self) {
        self.early_received.set(self.window_start as usize, false);
        self.window_start = sequence::advance(self.window_start, 1);
    }
}

impl ReceiverChannel for ReliableUnorderedReceiver {
    fn receive(&mut self, message: IncomingMessage, acks: &mut Vec<Ack>) -> Delivery {
        acks.push(ack_for(&message));
        let seq = message.sequence();
        let relate = sequence::relative_sequence_number(seq, self.window_start);

        if relate == 0 {
            self.advance_window();
            while self.early_received.get(self.window_start as usize) {
                self.advance_window();
            }
            return Delivery::Released(vec![message]);
        }

        if relate < 0 {
            return Delivery::Dropped(DropReason::LateOrDuplicate);
        }

        if relate as usize >= self.window_size {
            tracing::debug!(seq, window_start = self.window_start, "dropping too early message");
            return Delivery::Dropped(DropReason::TooEarly);
        }

        if self.early_received.get(seq as usize) {
            return Delivery::Dropped(DropReason::LateOrDuplicate);
        }
        self.early_received.set(seq as usize, true);
        Delivery::Released(vec![message])
    }

    fn window_start(&self) -> u16 {
        self.window_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_util::{incoming, released_sequences};
    use crate::frame::DeliveryMethod;

    fn feed(receiver: &mut ReliableUnorderedReceiver, seq: u16) -> Delivery {
        let mut acks = Vec::new();
        let delivery = receiver.receive(incoming(DeliveryMethod::ReliableUnordered, seq), &mut acks);
        assert_eq!(acks[0].sequence, seq);
        delivery
    }

    #[test]
    fn releases_out_of_order_immediately() {
        let mut receiver = ReliableUnorderedReceiver::new(8);
        assert_eq!(released_sequences(feed(&mut receiver, 2)), vec![2]);
        assert_eq!(released_sequences(feed(&mut receiver, 1)), vec![1]);
        assert_eq!(receiver.window_start(), 0);
        assert_eq!(released_sequences(feed(&mut receiver, 0)), vec![0]);
        assert_eq!(receiver.window_start(), 3);
    }

    #[test]
    fn resent_early_message_is_duplicate() {
        let mut receiver = ReliableUnorderedReceiver::new(8);
        feed(&mut receiver, 1);
        assert!(matches!(
            feed(&mut receiver, 1),
            Delivery::Dropped(DropReason::LateOrDuplicate)
        ));
        feed(&mut receiver, 0);
        assert!(matches!(
            feed(&mut receiver, 1),
            Delivery::Dropped(DropReason::LateOrDuplicate)
        ));
    }

    #[test]
    fn too_early_dropped() {
        let mut receiver = ReliableUnorderedReceiver::new(8);
        assert!(matches!(
            feed(&mut receiver, 8),
            Delivery::Dropped(DropReason::TooEarly)
        ));
    }
}
