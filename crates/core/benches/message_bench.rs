//! Message benchmarks: field sanitization and canonical (de)serialization.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use intelflow_core::message::{JsonOptions, Message};
use intelflow_core::schema::FieldSchema;
use serde_json::json;

fn sample_event(schema: &Arc<FieldSchema>) -> Message {
    let mut event = Message::new_event(Arc::clone(schema));
    event
        .update([
            ("feed.name", json!("Demo")),
            ("source.ip", json!("192.0.2.17")),
            ("source.fqdn", json!("Malicious.Example.org")),
            ("source.url", json!("hxxp://malicious.example.org/drop/payload.exe")),
            ("source.asn", json!("AS64496")),
            ("time.source", json!("2016-11-12 15:02")),
            ("classification.type", json!("c&c")),
            ("extra.tags", json!(["botnet", "dropper"])),
        ])
        .unwrap();
    event
}

fn bench_sanitize(c: &mut Criterion) {
    let schema = Arc::new(FieldSchema::builtin().unwrap());

    let mut group = c.benchmark_group("sanitize");
    group.throughput(Throughput::Elements(1));

    group.bench_function("event_8_fields", |b| {
        b.iter(|| black_box(sample_event(&schema)))
    });

    group.bench_function("datetime_auto", |b| {
        b.iter(|| {
            let mut event = Message::new_event(Arc::clone(&schema));
            event
                .add("time.source", black_box("Sat, 12 Nov 2016 15:02:00 GMT"))
                .unwrap();
            black_box(event)
        })
    });

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let schema = Arc::new(FieldSchema::builtin().unwrap());
    let event = sample_event(&schema);
    let flat = event.serialize().unwrap();

    let mut group = c.benchmark_group("serialization");
    group.throughput(Throughput::Bytes(flat.len() as u64));

    group.bench_function("to_json_flat", |b| {
        b.iter(|| black_box(event.to_json(&JsonOptions::flat()).unwrap()))
    });

    group.bench_function("to_json_hierarchical", |b| {
        b.iter(|| black_box(event.to_json(&JsonOptions::hierarchical()).unwrap()))
    });

    group.bench_function("unserialize", |b| {
        b.iter(|| black_box(Message::unserialize(black_box(&flat), Arc::clone(&schema)).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_sanitize, bench_serialization);
criterion_main!(benches);
