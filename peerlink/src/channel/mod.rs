//! Delivery-method channels and the per-method sender/receiver traits.
//!
//! Each logical channel of a connection owns one sender and one receiver,
//! selected once from the delivery method when the channel is first used.

pub mod reliable_ordered;
pub mod reliable_sender;
pub mod reliable_sequenced;
pub mod reliable_unordered;
pub mod unreliable;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{PeerConfig, UnreliableSizeBehaviour};
use crate::frame::DeliveryMethod;
use crate::message::{IncomingMessage, QueuedMessage, SendResult};
use crate::pool::MessagePool;
use crate::sequence;

pub use reliable_ordered::ReliableOrderedReceiver;
pub use reliable_sender::ReliableSender;
pub use reliable_sequenced::ReliableSequencedReceiver;
pub use reliable_unordered::ReliableUnorderedReceiver;
pub use unreliable::{UnreliableSender, UnreliableSequencedReceiver, UnreliableUnorderedReceiver};

/// Why a stored message went out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendReason {
    /// Not acknowledged within the resend delay.
    Delay,
    /// A later message was acknowledged first.
    HoleInSequence,
}

/// A message the connection should put on the wire.
///
/// The frame owns one recycle reference on `message`; the connection
/// releases it to the pool once the frame is encoded.
#[derive(Debug)]
pub struct OutgoingFrame {
    pub message: Arc<QueuedMessage>,
    pub sequence: u16,
    pub resend: Option<ResendReason>,
}

/// Acknowledgement of one sequence number of one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub message_type: u8,
    pub sequence: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Behind the window: already delivered or superseded.
    LateOrDuplicate,
    /// Too far ahead of the window to be tracked.
    TooEarly,
}

/// Outcome of handing an incoming message to a receiver.
#[derive(Debug)]
pub enum Delivery {
    /// Ready for the application, in release order.
    Released(Vec<IncomingMessage>),
    /// Buffered until the gap before it is filled.
    Withheld,
    Dropped(DropReason),
}

/// Sending side of a channel.
pub trait SenderChannel: Send {
    fn window_size(&self) -> usize;

    /// How many more sequence numbers may be assigned right now.
    fn allowed_sends(&self) -> usize;

    /// Messages waiting for window space.
    fn queued_sends(&self) -> usize;

    /// Window slots holding a message awaiting acknowledgement.
    fn stored_messages(&self) -> usize {
        0
    }

    /// Take ownership of one recycle reference on `message`.
    fn enqueue(&mut self, message: Arc<QueuedMessage>, current_mtu: usize, pool: &MessagePool)
        -> SendResult;

    /// Emit resends and newly allowed sends.
    fn send_queued_messages(
        &mut self,
        now: Instant,
        resend_delay: Duration,
        out: &mut Vec<OutgoingFrame>,
    );

    /// Apply an acknowledgement. Returns true when the ack is fresh enough
    /// to count as a liveness signal for the connection.
    fn receive_acknowledge(
        &mut self,
        now: Instant,
        sequence: u16,
        resend_delay: Duration,
        pool: &MessagePool,
        out: &mut Vec<OutgoingFrame>,
    ) -> bool;

    fn need_to_send_messages(&self) -> bool;

    /// Release every held message back to the pool.
    fn reset(&mut self, pool: &MessagePool);
}

/// Receiving side of a channel.
pub trait ReceiverChannel: Send {
    /// Classify `message`, pushing any acknowledgement it requires onto `acks`.
    fn receive(&mut self, message: IncomingMessage, acks: &mut Vec<Ack>) -> Delivery;

    /// Next sequence number the receiver expects.
    fn window_start(&self) -> u16;
}

/// Whether unreliable acks are expected for `method` under `config`.
pub fn flow_control_enabled(method: DeliveryMethod, config: &PeerConfig) -> bool {
    !(method == DeliveryMethod::Unreliable && config.suppress_unreliable_unordered_acks)
}

pub fn create_sender(method: DeliveryMethod, config: &PeerConfig) -> Box<dyn SenderChannel> {
    match method {
        DeliveryMethod::Unreliable | DeliveryMethod::UnreliableSequenced => {
            Box::new(UnreliableSender::new(
                sequence::UNRELIABLE_WINDOW_SIZE,
                flow_control_enabled(method, config),
                config.unreliable_size_behaviour == UnreliableSizeBehaviour::DropAboveMtu,
            ))
        }
        DeliveryMethod::ReliableOrdered => {
            Box::new(ReliableSender::new(sequence::RELIABLE_ORDERED_WINDOW_SIZE))
        }
        DeliveryMethod::ReliableSequenced => {
            Box::new(ReliableSender::new(sequence::RELIABLE_SEQUENCED_WINDOW_SIZE))
        }
        DeliveryMethod::ReliableUnordered => Box::new(ReliableSender::new(config.default_window_size)),
    }
}

pub fn create_receiver(method: DeliveryMethod, config: &PeerConfig) -> Box<dyn ReceiverChannel> {
    match method {
        DeliveryMethod::Unreliable => Box::new(UnreliableUnorderedReceiver::new(
            flow_control_enabled(method, config),
        )),
        DeliveryMethod::UnreliableSequenced => Box::new(UnreliableSequencedReceiver::new()),
        DeliveryMethod::ReliableUnordered => {
            Box::new(ReliableUnorderedReceiver::new(config.default_window_size))
        }
        DeliveryMethod::ReliableSequenced => Box::new(ReliableSequencedReceiver::new(
            sequence::RELIABLE_SEQUENCED_WINDOW_SIZE,
        )),
        DeliveryMethod::ReliableOrdered => Box::new(ReliableOrderedReceiver::new(
            sequence::RELIABLE_ORDERED_WINDOW_SIZE,
        )),
    }
}

pub(crate) fn ack_for(message: &IncomingMessage) -> Ack {
    Ack {
        message_type: message.message_type().as_u8(),
        sequence: message.sequence(),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use bytes::Bytes;

    use super::*;
    use crate::frame::MessageType;

    pub fn incoming(method: DeliveryMethod, sequence: u16) -> IncomingMessage {
        IncomingMessage::data(
            MessageType::user(method, 0).unwrap(),
            sequence,
            false,
            Bytes::from(sequence.to_le_bytes().to_vec()),
            Instant::now(),
        )
    }

    pub fn released_sequences(delivery: Delivery) -> Vec<u16> {
        match delivery {
            Delivery::Released(messages) => messages.iter().map(|m| m.sequence()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn queued(n: u8) -> Arc<QueuedMessage> {
        Arc::new(QueuedMessage::new(67, false, Bytes::from(vec![n; 4]), 1))
    }
}
