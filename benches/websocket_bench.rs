//! Benchmarks for the hot paths of the wire engine
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use ws_wire::Role;
use ws_wire::frame::{Frame, OpCode, encode_frame};
use ws_wire::mask::apply_mask;
use ws_wire::parser::parse;
use ws_wire::protocol::Protocol;
use ws_wire::utf8::{Utf8Validator, validate_utf8};

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 256, 1024, 4096, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            let mask = [0x37, 0xfa, 0x21, 0x3d];

            b.iter(|| {
                apply_mask(black_box(&mut data), black_box(mask));
            });
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    for size in [64, 1024, 16384] {
        let ascii = "a".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("whole_ascii", size), &ascii, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });
    }

    for size in [64, 1024, 4096] {
        let mixed = "Hello, 世界! 🎉 ".repeat(size / 20);
        group.throughput(Throughput::Bytes(mixed.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole_mixed", mixed.len()), &mixed, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });

        // Same text fed in 7-byte chunks, splitting code points
        group.bench_with_input(
            BenchmarkId::new("incremental_mixed", mixed.len()),
            &mixed,
            |b, data| {
                b.iter(|| {
                    let mut validator = Utf8Validator::new();
                    let bytes = data.as_bytes();
                    let mut ok = true;
                    for chunk in bytes.chunks(7) {
                        ok &= validator.push(black_box(chunk), false);
                    }
                    ok && validator.push(&[], true)
                });
            },
        );
    }

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for size in [8, 64, 256, 1024, 4096, 70_000] {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &payload, true, Some(mask));
        let frame_data = buf.freeze();
        group.throughput(Throughput::Bytes(frame_data.len() as u64));

        group.bench_with_input(BenchmarkId::new("masked", size), &frame_data, |b, data| {
            b.iter(|| parse(black_box(data)).unwrap());
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [8, 64, 256, 1024, 4096, 16384] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("unmasked", size), &payload, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);

            b.iter(|| {
                buf.clear();
                encode_frame(black_box(&mut buf), OpCode::Binary, black_box(data), true, None);
            });
        });

        let mask = [0x37, 0xfa, 0x21, 0x3d];
        group.bench_with_input(BenchmarkId::new("masked", size), &payload, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);

            b.iter(|| {
                buf.clear();
                encode_frame(
                    black_box(&mut buf),
                    OpCode::Binary,
                    black_box(data),
                    true,
                    Some(mask),
                );
            });
        });
    }

    group.finish();
}

/// Full inbound path: fragmented text reassembled by the state machine
fn bench_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive");

    for fragments in [1usize, 4, 16] {
        let mut wire = BytesMut::new();
        for i in 0..fragments {
            let opcode = if i == 0 { OpCode::Text } else { OpCode::Continuation };
            let frame = Frame::new(opcode, "fragment text ".repeat(64), i + 1 == fragments)
                .with_mask([1, 2, 3, 4]);
            frame.encode(&mut wire);
        }
        let wire = wire.freeze();
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("text", fragments), &wire, |b, data| {
            let mut actions = Vec::with_capacity(4);
            b.iter(|| {
                let mut protocol = Protocol::new(Role::Server, usize::MAX, usize::MAX);
                actions.clear();
                protocol.receive(black_box(data), &mut actions);
                assert_eq!(actions.len(), 1);
            });
        });
    }

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    use ws_wire::handshake::{generate_accept_key, generate_key};

    let mut group = c.benchmark_group("handshake");

    group.bench_function("generate_key", |b| {
        b.iter(generate_key);
    });

    group.bench_function("generate_accept_key", |b| {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        b.iter(|| generate_accept_key(black_box(key)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_mask,
    bench_utf8,
    bench_parse,
    bench_encode,
    bench_receive,
    bench_handshake,
);

criterion_main!(benches);
