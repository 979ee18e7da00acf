//! Reliable-sequenced receiver: newest wins, older stragglers are dropped.

use crate::channel::{ack_for, Ack, Delivery, DropReason, ReceiverChannel};
use crate::message::IncomingMessage;
use crate::sequence;

pub struct ReliableSequencedReceiver {
    window_size: usize,
    window_start: u16,
}

impl ReliableSequencedReceiver {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            window_start: 0,
        }
    }
}

impl ReceiverChannel for ReliableSequencedReceiver {
    fn receive(&mut self, message: IncomingMessage, acks: &mut Vec<Ack>) -> Delivery {
        acks.push(ack_for(&message));
        let seq = message.sequence();
        let relate = sequence::relative_sequence_number(seq, self.window_start);

        if relate < 0 {
            tracing::trace!(seq, window_start = self.window_start, "dropping late or duplicate");
            return Delivery::Dropped(DropReason::LateOrDuplicate);
        }

        // No slots here, so the boundary itself is still trackable.
        if relate as usize > self.window_size {
            tracing::debug!(seq, window_start = self.window_start, "dropping too early message");
            return Delivery::Dropped(DropReason::TooEarly);
        }

        self.window_start = sequence::advance(seq, 1);
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

    fn feed(receiver: &mut ReliableSequencedReceiver, seq: u16) -> Delivery {
        let mut acks = Vec::new();
        let delivery = receiver.receive(incoming(DeliveryMethod::ReliableSequenced, seq), &mut acks);
        assert_eq!(acks.len(), 1);
        delivery
    }

    #[test]
    fn newer_supersedes_older() {
        let mut receiver = ReliableSequencedReceiver::new(8);
        assert_eq!(released_sequences(feed(&mut receiver, 0)), vec![0]);
        assert_eq!(released_sequences(feed(&mut receiver, 3)), vec![3]);
        assert_eq!(receiver.window_start(), 4);
        assert!(matches!(
            feed(&mut receiver, 2),
            Delivery::Dropped(DropReason::LateOrDuplicate)
        ));
        assert!(matches!(
            feed(&mut receiver, 3),
            Delivery::Dropped(DropReason::LateOrDuplicate)
        ));
        assert_eq!(released_sequences(feed(&mut receiver, 4)), vec![4]);
    }

    #[test]
    fn boundary_is_inclusive() {
        let mut receiver = ReliableSequencedReceiver::new(8);
        assert_eq!(released_sequences(feed(&mut receiver, 8)), vec![8]);
        assert!(matches!(
            feed(&mut receiver, 18),
            Delivery::Dropped(DropReason::TooEarly)
        ));
    }
}
