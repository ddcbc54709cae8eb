//! Criterion micro-benchmarks for the record batch codec.
//!
//! These benchmarks measure:
//! - Encoding v2 record batches, uncompressed and with each codec
//! - Decoding a fetched record set, including CRC verification
//! - Key hashing for the default partitioner
//!
//! Run with: `cargo bench --bench record_batch_bench`

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use gregor::producer::partitioner::fnv1a32;
use gregor::protocol::records::{
    Compression, Record, RecordBatch, decode_record_set, validate_batch_crc,
};

fn batch(count: usize, value_size: usize, compression: Compression) -> RecordBatch {
    let value = Bytes::from(vec![b'v'; value_size]);
    RecordBatch {
        compression,
        first_timestamp: 1_700_000_000_000,
        max_timestamp: 1_700_000_000_000,
        last_offset_delta: count as i32 - 1,
        records: (0..count)
            .map(|i| Record {
                attributes: 0,
                timestamp_delta: 0,
                offset_delta: i as i32,
                key: Some(Bytes::from(format!("key-{i}"))),
                value: Some(value.clone()),
                headers: Vec::new(),
            })
            .collect(),
        ..Default::default()
    }
}

/// Benchmark encoding batches of different sizes.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_batch");

    for count in [1, 100, 1_000] {
        let batch = batch(count, 100, Compression::None);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("none", count), &batch, |b, batch| {
            b.iter(|| black_box(batch).encode(None));
        });
    }

    group.finish();
}

/// Benchmark each compression codec on the same 1000-record batch.
fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_compressed");
    group.throughput(Throughput::Elements(1_000));

    for codec in [Compression::Gzip, Compression::Snappy, Compression::Lz4, Compression::Zstd] {
        let batch = batch(1_000, 100, codec);
        group.bench_with_input(BenchmarkId::new("codec", codec), &batch, |b, batch| {
            b.iter(|| black_box(batch).encode(None));
        });
    }

    group.finish();
}

/// Benchmark decoding a record set of several batches.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_record_set");

    for codec in [Compression::None, Compression::Lz4] {
        let mut set = Vec::new();
        for base in 0..10 {
            let mut batch = batch(100, 100, codec);
            batch.base_offset = base * 100;
            set.extend_from_slice(&batch.encode(None).expect("encode"));
        }
        let set = Bytes::from(set);
        group.throughput(Throughput::Bytes(set.len() as u64));
        group.bench_with_input(BenchmarkId::new("codec", codec), &set, |b, set| {
            b.iter(|| decode_record_set(black_box(set)));
        });
    }

    group.finish();
}

/// Benchmark CRC verification alone.
fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_crc");

    for size in [100, 10_000, 100_000] {
        let encoded = batch(1, size, Compression::None).encode(None).expect("encode");
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| validate_batch_crc(black_box(encoded)));
        });
    }

    group.finish();
}

/// Benchmark key hashing.
fn bench_key_hash(c: &mut Criterion) {
    c.bench_function("fnv1a32_key", |b| {
        b.iter(|| fnv1a32(black_box(b"order-1234567890")));
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_compression,
    bench_decode,
    bench_crc,
    bench_key_hash,
);
criterion_main!(benches);
