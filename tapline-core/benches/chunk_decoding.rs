//! Chunked transfer decoding benchmarks
//!
//! Compares feeding whole bodies against network-sized slices, and measures
//! full dechunking with payload copy.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tapline_core::chunked::{ChunkDecoder, dechunk};

fn chunked_body(chunk_size: usize, chunks: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity((chunk_size + 16) * chunks + 5);
    for i in 0..chunks {
        body.extend_from_slice(format!("{:x};ext=1\r\n", chunk_size).as_bytes());
        body.extend(std::iter::repeat_n(b'a' + (i % 26) as u8, chunk_size));
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"0\r\nX-Trailer: done\r\n\r\n");
    body
}

fn decode_whole_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_whole");

    for chunk_size in [64usize, 4096, 65536] {
        let body = chunked_body(chunk_size, 64);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &body, |b, body| {
            b.iter(|| {
                let mut decoder = ChunkDecoder::new();
                black_box(decoder.push_bytes(black_box(body)));
                black_box(decoder.entity_length());
            });
        });
    }

    group.finish();
}

fn decode_sliced_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_sliced");
    let body = chunked_body(4096, 64);
    group.throughput(Throughput::Bytes(body.len() as u64));

    for slice in [1usize, 1460, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(slice), &slice, |b, &slice| {
            b.iter(|| {
                let mut decoder = ChunkDecoder::new();
                for part in body.chunks(slice) {
                    decoder.push_bytes(black_box(part));
                }
                black_box(decoder.state());
            });
        });
    }

    group.finish();
}

fn dechunk_benchmark(c: &mut Criterion) {
    let body = chunked_body(4096, 64);
    c.bench_function("dechunk_256k", |b| {
        b.iter(|| black_box(dechunk(black_box(&body))));
    });
}

criterion_group!(
    benches,
    decode_whole_benchmark,
    decode_sliced_benchmark,
    dechunk_benchmark
);
criterion_main!(benches);
