//! Framing and message encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docwire_protocol::{
    to_document, CursorId, DecodeOptions, Document, FrameEvent, FrameParser, JsonCodec, Query,
    Reply, DEFAULT_MAX_MESSAGE_SIZE,
};

fn create_test_document(payload_size: usize) -> Document {
    to_document(serde_json::json!({
        "_id": 42,
        "name": "bench",
        "tags": ["a", "b", "c"],
        "payload": {
            "data": "x".repeat(payload_size),
        }
    }))
    .unwrap()
}

fn create_test_reply(payload_size: usize, count: usize) -> Reply {
    let docs = (0..count).map(|_| create_test_document(payload_size)).collect();
    Reply::new(1, docs).with_cursor_id(CursorId::new(12345678))
}

fn bench_query_encode(c: &mut Criterion) {
    let codec = JsonCodec::new();
    let mut group = c.benchmark_group("query_encode");

    for size in [100, 1000, 10000] {
        let query = Query::new("bench.items", create_test_document(size), 0, 101);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &query, |b, query| {
            b.iter(|| black_box(query.encode(&codec).unwrap()));
        });
    }

    group.finish();
}

fn bench_reply_parse(c: &mut Criterion) {
    let codec = JsonCodec::new();
    let opts = DecodeOptions::default();
    let mut group = c.benchmark_group("reply_parse");

    for count in [1, 10, 100] {
        let encoded = create_test_reply(256, count).encode(&codec).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| black_box(Reply::parse(encoded, &codec, &opts).unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_single_chunk(c: &mut Criterion) {
    let codec = JsonCodec::new();
    let mut group = c.benchmark_group("frame_single_chunk");

    for size in [100, 1000, 10000] {
        let encoded = create_test_reply(size, 1).encode(&codec).unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut parser = FrameParser::new(DEFAULT_MAX_MESSAGE_SIZE);
                black_box(parser.push(encoded.clone()))
            });
        });
    }

    group.finish();
}

fn bench_frame_chunked(c: &mut Criterion) {
    let codec = JsonCodec::new();
    let encoded = create_test_reply(1000, 10).encode(&codec).unwrap();
    let mut group = c.benchmark_group("frame_chunked");

    for chunk_size in [3, 64, 1500] {
        let chunks: Vec<Bytes> = encoded
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunks,
            |b, chunks| {
                b.iter(|| {
                    let mut parser = FrameParser::new(DEFAULT_MAX_MESSAGE_SIZE);
                    let mut messages = 0;
                    for chunk in chunks {
                        for event in parser.push(chunk.clone()) {
                            if let FrameEvent::Message(_) = event {
                                messages += 1;
                            }
                        }
                    }
                    assert_eq!(messages, 1);
                    black_box(messages)
                });
            },
        );
    }

    group.finish();
}

fn bench_frame_pipelined(c: &mut Criterion) {
    let codec = JsonCodec::new();
    let mut group = c.benchmark_group("frame_pipelined");

    for count in [10, 100] {
        let mut stream = Vec::new();
        for _ in 0..count {
            stream.extend_from_slice(&create_test_reply(100, 1).encode(&codec).unwrap());
        }
        let stream = Bytes::from(stream);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut parser = FrameParser::new(DEFAULT_MAX_MESSAGE_SIZE);
                black_box(parser.push(stream.clone()))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_query_encode,
    bench_reply_parse,
    bench_frame_single_chunk,
    bench_frame_chunked,
    bench_frame_pipelined,
);

criterion_main!(benches);
