//! Benchmarks for the erasure code hot paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lan_iq_receiver::codec::{ErasureDecoder, ErasureEncoder};

/// Deterministic original blocks
fn originals(k: usize, block_size: usize) -> Vec<Vec<u8>> {
    (0..k)
        .map(|i| (0..block_size).map(|j| (i * 31 + j * 7) as u8).collect())
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("erasure_encode");
    for &(k, m) in &[(16u8, 4u8), (128, 8)] {
        let block_size = 504;
        let data = originals(k as usize, block_size);
        let mut encoder = ErasureEncoder::new(k, m, block_size).unwrap();
        group.throughput(Throughput::Bytes((k as usize * block_size) as u64));
        group.bench_with_input(BenchmarkId::new("slice", format!("{}+{}", k, m)), &data, |b, data| {
            b.iter(|| black_box(encoder.encode(data).unwrap()));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("erasure_decode");
    let (k, m, block_size) = (128u8, 8u8, 504usize);
    let data = originals(k as usize, block_size);
    let parity = ErasureEncoder::new(k, m, block_size)
        .unwrap()
        .encode(&data)
        .unwrap();

    for lost in [1usize, 4, 8] {
        // Lose the first `lost` data blocks after the metadata block
        let mut blocks: Vec<(u8, &[u8])> = data
            .iter()
            .enumerate()
            .filter(|(i, _)| *i == 0 || *i > lost)
            .map(|(i, b)| (i as u8, b.as_slice()))
            .collect();
        blocks.extend(
            parity
                .iter()
                .take(lost)
                .enumerate()
                .map(|(j, b)| (k + j as u8, b.as_slice())),
        );

        let mut decoder = ErasureDecoder::new(k, m, block_size).unwrap();
        group.throughput(Throughput::Bytes((lost * block_size) as u64));
        group.bench_with_input(BenchmarkId::new("lost", lost), &blocks, |b, blocks| {
            b.iter(|| black_box(decoder.decode(blocks).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
