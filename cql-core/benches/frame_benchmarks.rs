//! Frame codec and partitioner throughput benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cql_core::protocol::{Decoded, Frame, Opcode};
use cql_core::Murmur3Partitioner;

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in [0usize, 256, 4096, 65536] {
        let frame = Frame::response(4, 17, Opcode::Result, Bytes::from(vec![0xAB; size]));
        let mut wire = BytesMut::new();
        frame.encode(&mut wire).unwrap();

        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(frame.wire_size());
                frame.encode(&mut buf).unwrap();
                black_box(buf)
            })
        });

        group.bench_with_input(BenchmarkId::new("decode", size), &wire, |b, wire| {
            b.iter(|| {
                let mut buf = wire.clone();
                match Frame::decode(&mut buf).unwrap() {
                    Decoded::Frame(f) => black_box(f),
                    Decoded::NeedMoreData(_) => unreachable!(),
                }
            })
        });
    }

    group.finish();
}

fn bench_partitioner(c: &mut Criterion) {
    let mut group = c.benchmark_group("murmur3_token");
    let partitioner = Murmur3Partitioner;

    for size in [8usize, 16, 64, 512] {
        let key = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &key, |b, key| {
            b.iter(|| black_box(partitioner.token(black_box(key))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_partitioner);
criterion_main!(benches);
