// PeerLink channel-layer benchmarks using criterion.
//
// Measures:
//   - Message header encode / decode
//   - Datagram parsing of packed messages
//   - Reliable sender enqueue / send / acknowledge cycle
//   - Fragment split and reassembly

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use peerlink::channel::{create_sender, OutgoingFrame, SenderChannel};
use peerlink::fragment::{split, FragmentAssembler};
use peerlink::frame::{encode_message, parse_datagram, FrameHeader};
use peerlink::message::QueuedMessage;
use peerlink::{DeliveryMethod, MessagePool, PeerConfig};

// ---------------------------------------------------------------------------
// Header codec
// ---------------------------------------------------------------------------

fn bench_header_codec(c: &mut Criterion) {
    let header = FrameHeader::new(72, true, 0x2ab, 1200);
    let mut buf = BytesMut::with_capacity(8);

    c.bench_function("header_encode", |b| {
        b.iter(|| {
            buf.clear();
            black_box(header).encode_into(&mut buf);
            black_box(&buf);
        });
    });

    header.encode_into(&mut buf);
    let encoded = buf.to_vec();
    c.bench_function("header_decode", |b| {
        b.iter(|| black_box(FrameHeader::decode(black_box(&encoded)).unwrap()));
    });
}

// ---------------------------------------------------------------------------
// Datagram parsing
// ---------------------------------------------------------------------------

fn bench_parse_datagram(c: &mut Criterion) {
    let counts: &[usize] = &[1, 8, 32];

    let mut group = c.benchmark_group("parse_datagram");
    for &count in counts {
        let mut buf = BytesMut::new();
        for i in 0..count {
            encode_message(&mut buf, 67, false, i as u16, &[0xAB; 32]);
        }
        group.throughput(Throughput::Bytes(buf.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &buf, |b, buf| {
            b.iter(|| {
                for frame in parse_datagram(black_box(buf)) {
                    black_box(frame.unwrap());
                }
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Reliable sender
// ---------------------------------------------------------------------------

fn bench_reliable_cycle(c: &mut Criterion) {
    let config = PeerConfig::default();
    let pool = MessagePool::new(128);
    let delay = Duration::from_millis(100);

    c.bench_function("reliable_ordered_send_ack_64", |b| {
        let mut sender = create_sender(DeliveryMethod::ReliableOrdered, &config);
        let mut frames: Vec<OutgoingFrame> = Vec::with_capacity(64);
        let payload = Bytes::from_static(&[0xAB; 64]);
        b.iter(|| {
            let now = Instant::now();
            for _ in 0..64 {
                let message = Arc::new(QueuedMessage::new(67, false, payload.clone(), 1));
                sender.enqueue(message, 1408, &pool);
            }
            sender.send_queued_messages(now, delay, &mut frames);
            let sequences: Vec<u16> = frames.iter().map(|f| f.sequence).collect();
            for frame in frames.drain(..) {
                pool.release(frame.message);
            }
            for sequence in sequences {
                sender.receive_acknowledge(now, sequence, delay, &pool, &mut frames);
            }
            for frame in frames.drain(..) {
                pool.release(frame.message);
            }
        });
    });
}

// ---------------------------------------------------------------------------
// Fragmentation
// ---------------------------------------------------------------------------

fn bench_fragments(c: &mut Criterion) {
    let sizes: &[usize] = &[4096, 65536];

    let now = Instant::now();
    let mut group = c.benchmark_group("fragment_reassemble");
    for &size in sizes {
        let payload = vec![0xCDu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{size}B")), &payload, |b, p| {
            b.iter(|| {
                let mut assembler = FragmentAssembler::new();
                let mut whole = None;
                for fragment in split(1, p, 1408) {
                    whole = assembler.insert(now, &fragment).unwrap();
                }
                black_box(whole.unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_header_codec, bench_parse_datagram, bench_reliable_cycle, bench_fragments);
criterion_main!(benches);
