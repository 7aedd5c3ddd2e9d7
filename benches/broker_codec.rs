//! Broker codec throughput benchmark.
//!
//! Measures encode + write_frame and read_frame + decode of publish
//! requests carrying bodies of increasing size, using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use sortie_core::broker::codec::{decode, encode, read_frame, write_frame, Operation, Request, MSG_REQUEST};
use sortie_core::broker::Message;
use sortie_core::types::CorrelationId;

const MAX_FRAME: u32 = 5 * 1024 * 1024;

fn publish(size: usize) -> Request {
    let message = Message::new(json!({
        "module": "scan",
        "arguments": {"blob": "x".repeat(size)},
    }))
    .with_correlation(CorrelationId::new())
    .with_reply_to("sortie.core.payload.response");
    Request {
        id: 1,
        op: Operation::Publish {
            queue: "sortie.worker.w1.payload.request".to_string(),
            message,
        },
    }
}

fn bench_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let body_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("encode_write");
    for &size in body_sizes {
        let request = publish(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, r| {
            b.iter(|| {
                rt.block_on(async {
                    let payload = encode(black_box(r)).unwrap();
                    let mut buf = Vec::with_capacity(payload.len() + 5);
                    write_frame(&mut buf, MSG_REQUEST, &payload).await.unwrap();
                    buf
                })
            });
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let body_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("read_decode");
    for &size in body_sizes {
        // Pre-build the wire frame
        let wire = rt.block_on(async {
            let payload = encode(&publish(size)).unwrap();
            let mut buf = Vec::new();
            write_frame(&mut buf, MSG_REQUEST, &payload).await.unwrap();
            buf
        });
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut reader = black_box(w.as_slice());
                    let (_, payload) = read_frame(&mut reader, MAX_FRAME).await.unwrap().unwrap();
                    decode::<Request>(&payload).unwrap()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
