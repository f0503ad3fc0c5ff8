use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_bus::{codec, EventClass, EventEnvelope, EnvelopeValidator, ValidationPolicy};
use rand::Rng;
use serde_json::{json, Map, Value};

fn envelope_with_fields(fields: usize) -> EventEnvelope {
    let mut rng = rand::thread_rng();
    let mut data = Map::new();
    data.insert("id".to_string(), json!(format!("t-{}", rng.gen::<u32>())));
    for i in 0..fields {
        data.insert(format!("f{i}"), json!(rng.gen::<u64>()));
    }

    EventEnvelope::builder("thing.created", "smoke-test")
        .class(EventClass::Domain)
        .partition_by_data("id")
        .data(Value::Object(data))
        .build()
        .expect("bench envelope builds")
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope-codec");
    for fields in [4usize, 64, 512] {
        let envelope = envelope_with_fields(fields);
        let bytes = codec::encode(&envelope).expect("encode");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", fields), &envelope, |b, env| {
            b.iter(|| codec::encode(black_box(env)))
        });
        group.bench_with_input(BenchmarkId::new("decode", fields), &bytes, |b, bytes| {
            b.iter(|| codec::decode(black_box(bytes)))
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let validator = EnvelopeValidator::new(ValidationPolicy::new().allow_types(["thing.created"]));
    let mut group = c.benchmark_group("envelope-validate");
    for fields in [4usize, 512] {
        let bytes = codec::encode(&envelope_with_fields(fields)).expect("encode");
        group.bench_with_input(BenchmarkId::new("decode+validate", fields), &bytes, |b, bytes| {
            b.iter(|| {
                let envelope = codec::decode(black_box(bytes)).expect("decode");
                validator.validate(&envelope, Utc::now())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_validate);
criterion_main!(benches);
