// PeerLink payload encryption benchmarks using criterion.
//
// Measures encrypt / decrypt throughput for each encryption at typical
// datagram payload sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use peerlink_crypt::{Aes256GcmEncryption, ChaCha20Poly1305Encryption, MessageEncryption, XorEncryption};

const SIZES: [usize; 3] = [64, 512, 1400];

fn encryptions() -> Vec<(&'static str, Box<dyn MessageEncryption>)> {
    let xor: Box<dyn MessageEncryption> = Box::new(XorEncryption::from_secret("bench secret").unwrap());
    let aes: Box<dyn MessageEncryption> = Box::new(Aes256GcmEncryption::new([0x42; 32]));
    let chacha: Box<dyn MessageEncryption> = Box::new(ChaCha20Poly1305Encryption::new([0x42; 32]));
    vec![("xor", xor), ("aes256gcm", aes), ("chacha20poly1305", chacha)]
}

// ---------------------------------------------------------------------------
// Encrypt
// ---------------------------------------------------------------------------

fn bench_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt");
    for (name, enc) in encryptions() {
        for size in SIZES {
            let payload = vec![0xAB; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &payload, |b, payload| {
                b.iter(|| black_box(enc.encrypt(black_box(payload)).unwrap()));
            });
        }
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Decrypt
// ---------------------------------------------------------------------------

fn bench_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("decrypt");
    for (name, enc) in encryptions() {
        for size in SIZES {
            let sealed = enc.encrypt(&vec![0xAB; size]).unwrap();
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &sealed, |b, sealed| {
                b.iter(|| black_box(enc.decrypt(black_box(sealed)).unwrap()));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_encrypt, bench_decrypt);
criterion_main!(benches);
