//! Messaging benchmark suite.
//!
//! Benchmarks the hot paths of the frame pipeline:
//! - envelope encode/decode
//! - registry decode, typed and untyped
//! - end-to-end call round trip over localhost
//!
//! Run with: cargo bench --bench messaging
//! Results saved to: target/criterion/

use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use webmessage::{
    CallId, Device, Envelope, MessageClient, MessageServer, MessageService, PayloadRegistry,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildProgress {
    progress: f64,
    step: String,
}

fn sample_payload() -> BuildProgress {
    BuildProgress {
        progress: 0.25,
        step: "compile".to_string(),
    }
}

fn sample_frame() -> String {
    Envelope::request("build/progress", CallId::from("a1b2c3d4"), &sample_payload())
        .expect("serialize")
        .to_json()
        .expect("to_json")
}

// ============================================================================
// Benchmark: Envelope
// ============================================================================

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let frame = sample_frame();
    let payload = sample_payload();

    group.bench_function("encode", |b| {
        b.iter(|| {
            Envelope::request("build/progress", CallId::from("a1b2c3d4"), &payload)
                .expect("serialize")
                .to_json()
                .expect("to_json")
        });
    });

    group.bench_function("decode", |b| {
        b.iter(|| Envelope::from_json(&frame).expect("parse"));
    });

    group.finish();
}

// ============================================================================
// Benchmark: Registry
// ============================================================================

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let frame = sample_frame();

    let typed = PayloadRegistry::new();
    typed
        .register::<BuildProgress>("build/progress")
        .expect("register");
    group.bench_function("decode_typed", |b| {
        b.iter(|| typed.decode(&frame).expect("decode"));
    });

    let untyped = PayloadRegistry::new();
    group.bench_function("decode_untyped", |b| {
        b.iter(|| untyped.decode(&frame).expect("decode"));
    });

    group.finish();
}

// ============================================================================
// Benchmark: Call Round Trip
// ============================================================================

fn bench_call_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let client = rt.block_on(async {
        let server = MessageServer::bind_addr("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let (service, _events) = MessageService::new();
        service
            .register_handler(
                "build/progress",
                |_context, payload: Option<BuildProgress>| async move {
                    Ok(payload.unwrap_or_else(|| BuildProgress {
                        progress: 0.0,
                        step: String::new(),
                    }))
                },
            )
            .expect("register");
        // The accept loop holds its own handle; the server outlives this block.
        server.add_service("/", service).expect("add service");

        let (client, _notifications) = MessageClient::new();
        client
            .attach(Device::new("127.0.0.1", server.port()))
            .await
            .expect("attach");
        client.connect().await.expect("connect");
        client
    });

    let mut group = c.benchmark_group("round_trip");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    let payload = sample_payload();
    group.bench_function("call", |b| {
        b.to_async(&rt).iter(|| {
            let client = client.clone();
            let payload = payload.clone();
            async move {
                let _: BuildProgress = client
                    .call("build/progress", &payload)
                    .await
                    .expect("call");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_envelope, bench_registry, bench_call_round_trip);
criterion_main!(benches);
