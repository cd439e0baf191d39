//! Performance benchmarks for the frame codec.
//!
//! These benchmarks measure the hot paths of a transfer:
//! - Envelope encoding of file chunks
//! - Frame decoding with and without compression

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::messages::FileChunk;
use protocol::{Envelope, EnvelopeCodec, Frame, FrameCodec, Message};
use tokio_util::codec::{Decoder, Encoder};

fn chunk_envelope(size: usize) -> Envelope {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    Envelope::new(1, Message::Chunk(FileChunk::new(data)))
}

/// Benchmark encoding of chunk envelopes at typical sizes.
fn bench_envelope_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");

    for size in [1024usize, 16 * 1024, 256 * 1024] {
        let envelope = chunk_envelope(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, env| {
            let mut codec = EnvelopeCodec::new();
            let mut buf = BytesMut::with_capacity(size * 2);
            b.iter(|| {
                buf.clear();
                codec.encode(black_box(env.clone()), &mut buf).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark decoding of frames, compressed versus raw.
fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let payload = vec![0u8; 64 * 1024];
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for (name, mut codec) in [
        ("lz4", FrameCodec::new()),
        ("raw", FrameCodec::without_compression()),
    ] {
        let mut encoded = BytesMut::new();
        codec
            .encode(Frame::new(payload.clone()), &mut encoded)
            .unwrap();
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(codec.decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_envelope_encode, bench_frame_decode);
criterion_main!(benches);
