//! Wire format, sequence arithmetic, fragmentation and sender windows
//! through the public module API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use peerlink::channel::{create_sender, OutgoingFrame, ResendReason, SenderChannel};
use peerlink::fragment::{split, FragmentAssembler};
use peerlink::frame::{encode_message, parse_datagram, FrameHeader, HEADER_SIZE};
use peerlink::message::QueuedMessage;
use peerlink::sequence::{advance, relative_sequence_number};
use peerlink::{DeliveryMethod, LibraryMessage, MessagePool, MessageType, PeerConfig, PeerError, SendResult};

fn queued(message_type: u8, n: u8) -> Arc<QueuedMessage> {
    Arc::new(QueuedMessage::new(message_type, false, Bytes::from(vec![n; 8]), 1))
}

fn release_all(pool: &MessagePool, frames: &mut Vec<OutgoingFrame>) -> Vec<u16> {
    frames
        .drain(..)
        .map(|frame| {
            let sequence = frame.sequence;
            pool.release(frame.message);
            sequence
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[test]
fn datagram_with_mixed_message_types() {
    let mut buf = BytesMut::new();
    encode_message(&mut buf, 0, false, 0, b"unconnected");
    encode_message(&mut buf, 68, true, 1023, b"frag");
    encode_message(&mut buf, LibraryMessage::Acknowledge as u8, false, 0, &[67, 5, 0]);

    let frames: Vec<_> = parse_datagram(&buf).collect::<Result<_, _>>().unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].message_type, MessageType::Unconnected);
    assert_eq!(
        frames[1].message_type,
        MessageType::User {
            method: DeliveryMethod::ReliableOrdered,
            channel: 1
        }
    );
    assert!(frames[1].is_fragment);
    assert_eq!(frames[1].sequence, 1023);
    assert_eq!(frames[2].message_type, MessageType::Library(LibraryMessage::Acknowledge));
    assert_eq!(frames[2].payload, &[67, 5, 0]);
}

#[test]
fn reserved_message_type_is_rejected() {
    let mut buf = BytesMut::new();
    FrameHeader::new(99, false, 0, 0).encode_into(&mut buf);
    assert_eq!(buf.len(), HEADER_SIZE);
    let first = parse_datagram(&buf).next().unwrap();
    assert!(matches!(first, Err(PeerError::UnknownMessageType(99))));
}

// ---------------------------------------------------------------------------
// Sequence numbers
// ---------------------------------------------------------------------------

#[test]
fn relative_sequence_wraps_around() {
    assert_eq!(relative_sequence_number(0, 1023), 1);
    assert_eq!(relative_sequence_number(1023, 0), -1);
    assert_eq!(relative_sequence_number(511, 0), 511);
    assert_eq!(relative_sequence_number(512, 0), -512);
    assert_eq!(advance(1020, 10), 6);
}

// ---------------------------------------------------------------------------
// Fragmentation
// ---------------------------------------------------------------------------

#[test]
fn fragments_reassemble_in_any_order() {
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    let fragments = split(9, &payload, 1408);
    assert!(fragments.len() > 7);
    assert!(fragments.iter().all(|f| f.len() + HEADER_SIZE <= 1408));

    let now = Instant::now();
    let mut assembler = FragmentAssembler::new();
    let mut whole = None;
    for fragment in fragments.iter().rev() {
        assert!(whole.is_none());
        whole = assembler.insert(now, fragment).unwrap();
    }
    assert_eq!(whole.unwrap().as_ref(), payload.as_slice());
    assert_eq!(assembler.pending_groups(), 0);
}

#[test]
fn repeated_chunk_starts_a_new_group() {
    let now = Instant::now();
    let first = vec![1u8; 3000];
    let second = vec![2u8; 3000];
    let old = split(2, &first, 1000);
    let new = split(2, &second, 1000);
    let mut assembler = FragmentAssembler::new();

    // every chunk but the last of the first message
    for fragment in &old[..old.len() - 1] {
        assert!(assembler.insert(now, fragment).unwrap().is_none());
    }
    let mut whole = None;
    for fragment in &new {
        assert!(whole.is_none());
        whole = assembler.insert(now, fragment).unwrap();
    }
    assert_eq!(whole.unwrap().as_ref(), second.as_slice());
    assert_eq!(assembler.pending_groups(), 0);
}

// ---------------------------------------------------------------------------
// Reliable sender window
// ---------------------------------------------------------------------------

#[test]
fn reliable_sender_queues_beyond_window() {
    let config = PeerConfig::default();
    let pool = MessagePool::new(16);
    let mut sender = create_sender(DeliveryMethod::ReliableOrdered, &config);
    let window = sender.window_size();

    for i in 0..window {
        assert_eq!(sender.enqueue(queued(67, i as u8), 1408, &pool), SendResult::Sent);
    }
    assert_eq!(sender.enqueue(queued(67, 0xff), 1408, &pool), SendResult::Queued);

    let now = Instant::now();
    let delay = Duration::from_millis(100);
    let mut frames = Vec::new();
    sender.send_queued_messages(now, delay, &mut frames);
    assert_eq!(frames.len(), window);
    release_all(&pool, &mut frames);
    assert_eq!(sender.queued_sends(), 1);
    assert_eq!(sender.allowed_sends(), 0);

    // acking the window start frees one slot for the queued message
    sender.receive_acknowledge(now, 0, delay, &pool, &mut frames);
    sender.send_queued_messages(now, delay, &mut frames);
    assert_eq!(release_all(&pool, &mut frames), vec![window as u16]);
    assert_eq!(sender.queued_sends(), 0);
}

#[test]
fn unacknowledged_message_is_resent_after_delay() {
    let config = PeerConfig::default();
    let pool = MessagePool::new(16);
    let mut sender = create_sender(DeliveryMethod::ReliableUnordered, &config);
    sender.enqueue(queued(34, 1), 1408, &pool);

    let start = Instant::now();
    let delay = Duration::from_millis(100);
    let mut frames = Vec::new();
    sender.send_queued_messages(start, delay, &mut frames);
    release_all(&pool, &mut frames);

    sender.send_queued_messages(start + Duration::from_millis(50), delay, &mut frames);
    assert!(frames.is_empty());

    sender.send_queued_messages(start + Duration::from_millis(150), delay, &mut frames);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].resend, Some(ResendReason::Delay));
    release_all(&pool, &mut frames);

    sender.receive_acknowledge(start + Duration::from_millis(160), 0, delay, &pool, &mut frames);
    assert_eq!(sender.stored_messages(), 0);
    assert_eq!(pool.stats().recycled, 1);
}
