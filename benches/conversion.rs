// benches/conversion.rs
//! Conversion benchmarks: wide objects, deep nesting, large arrays
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use js_value_bridge::dynamic::engine_to_json;
use js_value_bridge::{to_engine, to_host, EngineRuntime, EngineValue, HostEnvironment};

fn wide_object(rt: &EngineRuntime, field_count: usize) -> EngineValue {
    let object = rt.create_object().unwrap();
    for i in 0..field_count {
        let key = format!("field_{}", i);
        // Mix numbers and strings
        let value = if i % 2 == 0 {
            EngineValue::Number(i as f64 * 1.5)
        } else {
            EngineValue::String(format!("value {}", i))
        };
        rt.set_property(&object, key.as_str(), value).unwrap();
    }
    object
}

fn deep_chain(rt: &EngineRuntime, depth: usize) -> EngineValue {
    let mut current = EngineValue::Null;
    for _ in 0..depth {
        let next = rt.create_object().unwrap();
        rt.set_property(&next, "child", current).unwrap();
        current = next;
    }
    current
}

fn benchmark_wide_objects(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_object_to_host");

    for field_count in [10, 100, 1000] {
        let rt = EngineRuntime::new();
        let object = wide_object(&rt, field_count);

        group.bench_with_input(
            BenchmarkId::from_parameter(field_count),
            &object,
            |b, object| {
                b.iter(|| {
                    // A fresh environment per iteration keeps the heap from growing.
                    let env = HostEnvironment::new();
                    to_host(&env, &rt, black_box(object)).unwrap()
                })
            },
        );
    }

    group.finish();
}

fn benchmark_deep_nesting(c: &mut Criterion) {
    let rt = EngineRuntime::new();
    let chain = deep_chain(&rt, 256);
    let _root = rt.root_guard(chain.clone());

    c.bench_function("deep_chain_round_trip", |b| {
        b.iter(|| {
            let env = HostEnvironment::new();
            let host = to_host(&env, &rt, black_box(&chain)).unwrap();
            let back = to_engine(&env, &rt, host).unwrap();
            rt.collect_garbage();
            back
        })
    });
}

fn benchmark_large_array(c: &mut Criterion) {
    let rt = EngineRuntime::new();
    let array = rt
        .create_array_from((0..10_000).map(|i| EngineValue::Number(i as f64)))
        .unwrap();

    c.bench_function("array_10k_to_host", |b| {
        b.iter(|| {
            let env = HostEnvironment::new();
            to_host(&env, &rt, black_box(&array)).unwrap()
        })
    });

    c.bench_function("array_10k_to_json", |b| {
        b.iter(|| engine_to_json(&rt, black_box(&array)).unwrap())
    });
}

criterion_group!(
    benches,
    benchmark_wide_objects,
    benchmark_deep_nesting,
    benchmark_large_array
);
criterion_main!(benches);
