use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipeflow::{Element, EventBus, PassthroughStage, Pipeline, StageOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn input(n: i64) -> Vec<Element> {
    (0..n).map(|i| json!({ "id": i, "payload": "x".repeat(64) })).collect()
}

/// Run against a bus with no subscribers so events cost next to nothing
fn quiet(pipeline: Pipeline) -> Pipeline {
    pipeline.with_sink(Arc::new(EventBus::new()))
}

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    let pipeline = quiet(Pipeline::from_vec(input(1000)).stage(PassthroughStage, StageOptions::new()));
    c.bench_function("single_stage_1000_elements", |b| {
        b.iter(|| {
            let out = pipeline.collect().expect("Pipeline run failed");
            black_box(out.len())
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    let pipeline = quiet(
        Pipeline::from_vec(input(1000))
            .map(|v| Ok(v["id"].clone()))
            .filter(|v| Ok(v.as_i64().unwrap_or(0) % 2 == 0))
            .map(|v| Ok(json!(v.as_i64().unwrap_or(0) * 10))),
    );
    c.bench_function("three_stage_1000_elements", |b| {
        b.iter(|| {
            let out = pipeline.collect().expect("Pipeline run failed");
            black_box(out.len())
        });
    });
}

fn benchmark_windowed_throughput(c: &mut Criterion) {
    let pipeline = quiet(
        Pipeline::from_vec(input(5000))
            .sliding(10, 5)
            .expect("valid window")
            .batch(50, Duration::from_secs(1)),
    );
    c.bench_function("sliding_then_batch_5000_elements", |b| {
        b.iter(|| {
            let out = pipeline.collect().expect("Pipeline run failed");
            black_box(out.len())
        });
    });
}

fn benchmark_parallel_map(c: &mut Criterion) {
    let pipeline = quiet(Pipeline::from_vec(input(1000)).parallel_map(4, |v| {
        std::thread::sleep(Duration::from_micros(20));
        Ok(v["id"].clone())
    }));
    c.bench_function("parallel_map_4_workers_1000_elements", |b| {
        b.iter(|| {
            let out = pipeline.collect().expect("Pipeline run failed");
            black_box(out.len())
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_single_stage_throughput, benchmark_three_stage_throughput,
        benchmark_windowed_throughput, benchmark_parallel_map
);
criterion_main!(benches);
