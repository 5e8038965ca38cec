//! Per-packet processing latency benchmarks for keel-transport.
//!
//! Measures latency contributions of the hot-path components:
//! - Header encode/decode
//! - Message slicing in the outgoing handler (various payload sizes)
//! - Slice acceptance and reassembly in the incoming handler
//! - Frame construction from the buffer pool
//!
//! Run with: cargo bench --package keel-transport

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Clock;
use std::net::SocketAddr;
use std::time::Duration;

use keel_transport::pool::{BufferPool, PooledBuf};
use keel_transport::receiver::IncomingHandler;
use keel_transport::sender::OutgoingHandler;
use keel_transport::wire::{encode_frame, frame_payload, Header, MTU};

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

// ─── Header ──────────────────────────────────────────────────────────────

fn bench_header_encode(c: &mut Criterion) {
    let header = Header::reliable(4_242, 17, 9);
    c.bench_function("header_encode_reliable", |b| {
        let mut buf = Vec::with_capacity(MTU);
        b.iter(|| {
            buf.clear();
            black_box(&header).encode(&mut buf);
            black_box(&buf);
        });
    });
}

fn bench_header_decode(c: &mut Criterion) {
    let mut buf = Vec::new();
    Header::reliable(4_242, 17, 9).encode(&mut buf);
    let from = peer();
    c.bench_function("header_decode_reliable", |b| {
        b.iter(|| black_box(Header::decode(black_box(&buf), from)));
    });
}

// ─── Frames ──────────────────────────────────────────────────────────────

fn bench_encode_frame(c: &mut Criterion) {
    let pool = BufferPool::new(16);
    let header = Header::reliable(1, 1, 1);
    let payload = vec![0xAB; 1_000];
    c.bench_function("encode_frame_1000B", |b| {
        b.iter(|| {
            let frame = encode_frame(&pool, &header, black_box(&payload));
            black_box(frame.len());
        });
    });
}

// ─── Outgoing ────────────────────────────────────────────────────────────

fn bench_slicing(c: &mut Criterion) {
    let mut group = c.benchmark_group("outgoing_enqueue");
    for size in [1_024usize, 16 * 1_024, 256 * 1_024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let pool = BufferPool::new(512);
            let payload = vec![0x5A; size];
            b.iter(|| {
                let mut tx = OutgoingHandler::new(pool.clone(), Duration::from_millis(10));
                tx.enqueue(pool.rent_copy(&payload)).ok();
                black_box(tx.slice_count());
            });
        });
    }
    group.finish();
}

// ─── Incoming ────────────────────────────────────────────────────────────

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("incoming_reassembly");
    for size in [16 * 1_024usize, 256 * 1_024] {
        let pool = BufferPool::new(512);
        let clock = Clock::new();
        let mut tx = OutgoingHandler::new(pool.clone(), Duration::from_millis(10));
        tx.enqueue(pool.rent_copy(&vec![0xC3; size])).ok();
        let frames: Vec<Vec<u8>> = tx
            .packets_to_send(clock.now())
            .iter()
            .map(PooledBuf::to_vec)
            .collect();
        let from = peer();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| {
                let mut rx = IncomingHandler::new(pool.clone());
                for frame in &frames {
                    if let Ok(header) = Header::decode(frame, from) {
                        black_box(rx.on_slice(&header, frame_payload(frame, &header)));
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_header_encode,
    bench_header_decode,
    bench_encode_frame,
    bench_slicing,
    bench_reassembly,
);
criterion_main!(benches);
