use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use midimesh_proto::{classify, MeshPacket, NodeId, WireContext};
use midimesh_rt::{RtEntry, RtRingBuffer};

fn classifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("classifier");
    group.measurement_time(Duration::from_secs(5));

    let messages: [&[u8]; 4] = [
        &[0x90, 60, 100],
        &[0xF8],
        &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7],
        &[0xF1, 0x00],
    ];

    group.bench_function("classify_mixed", |b| {
        b.iter(|| {
            for message in &messages {
                black_box(classify(black_box(message)));
            }
        });
    });

    group.finish();
}

fn codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let source = NodeId::generate();
    let dest = NodeId::generate();
    let mut packet = MeshPacket::data(&source, &dest, 7, vec![0x90, 0x3C, 0x64], 41, 123_456);
    packet.set_context(WireContext {
        hop_count: 2,
        visited: vec![(0xAABB_CCDD, 1), (0x0102_0304, 9)],
    });
    let bytes = packet.to_bytes();

    group.bench_function("serialize_with_context", |b| {
        let mut buf = Vec::with_capacity(64);
        b.iter(|| {
            buf.clear();
            packet.serialize(&mut buf);
            black_box(buf.len());
        });
    });

    group.bench_function("parse_with_context", |b| {
        b.iter(|| {
            black_box(MeshPacket::parse(black_box(&bytes)).unwrap());
        });
    });

    group.finish();
}

fn ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");

    group.bench_function("push_pop_cycle", |b| {
        let ring = RtRingBuffer::with_default_capacity();
        let entry = RtEntry::new(1, &[0x90, 60, 100], 0).unwrap();
        b.iter(|| {
            ring.push(black_box(entry));
            black_box(ring.pop());
        });
    });

    group.bench_function("drain_batch_32", |b| {
        let ring = RtRingBuffer::with_default_capacity();
        let entry = RtEntry::new(1, &[0x90, 60, 100], 0).unwrap();
        let mut out = [entry; 32];
        b.iter(|| {
            for _ in 0..32 {
                ring.push(entry);
            }
            black_box(ring.drain(&mut out));
        });
    });

    group.finish();
}

criterion_group!(benches, classifier, codec, ring);
criterion_main!(benches);
