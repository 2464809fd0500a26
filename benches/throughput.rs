//! Throughput of the per-block hot path: fingerprinting and compression.

use bsync::codec::{BlockCodec, Level};
use bsync::fingerprint::block_digest;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const BLOCK: usize = 4 * 1024 * 1024;

fn pseudo_random(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn bench_digest(c: &mut Criterion) {
    let random = pseudo_random(BLOCK, 0xbe9c);
    let zeros = vec![0u8; BLOCK];

    let mut group = c.benchmark_group("digest");
    group.throughput(Throughput::Bytes(BLOCK as u64));
    group.bench_function("random_block", |b| {
        b.iter(|| block_digest(black_box(&random)))
    });
    group.bench_function("zero_block", |b| b.iter(|| block_digest(black_box(&zeros))));
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let text: Vec<u8> = b"block device mirror payload "
        .iter()
        .cycle()
        .take(BLOCK)
        .cloned()
        .collect();
    let codec = BlockCodec::new(Level::Fastest);
    let encoded = codec.encode(&text).unwrap();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(BLOCK as u64));
    group.bench_function("encode_fastest", |b| {
        b.iter(|| codec.encode(black_box(&text)).unwrap())
    });
    group.bench_function("decode", |b| {
        b.iter(|| codec.decode(black_box(&encoded)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_digest, bench_codec);
criterion_main!(benches);
