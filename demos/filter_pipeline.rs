//! Number processing pipeline demonstrating filtering and transformations
//!
//! Pipeline:
//! 1. Source: numbers 1-100
//! 2. Filter: keep only even numbers
//! 3. Transform: multiply by 10
//! 4. Batch: groups of 5
//! 5. Aggregate: sum every batch as it arrives, under a supervisor
//!
//! Usage: cargo run --example filter_pipeline --release

use parking_lot::Mutex;
use pipeflow::{metrics, Pipeline, RunOptions, Supervisor};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Totals {
    sum: u64,
    count: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Number Processing Pipeline");
    println!("==========================");
    println!("Generating numbers 1-100, filtering evens, multiplying by 10, and summing");
    println!();

    let start = Instant::now();

    let pipeline = Pipeline::from_vec((1..=100).map(|n| json!(n)).collect())
        .with_name("filter_pipeline")
        .filter(|v| Ok(v.as_u64().unwrap_or(1) % 2 == 0))
        .map(|v| Ok(json!(v.as_u64().unwrap_or(0) * 10)))
        .batch(5, Duration::from_millis(100));

    let totals = Arc::new(Mutex::new(Totals::default()));
    let sink = Arc::clone(&totals);

    let supervisor = Supervisor::default();
    let runner = supervisor.submit(
        pipeline,
        RunOptions::new().name("summer").on_element(move |batch| {
            let mut totals = sink.lock();
            for n in batch.as_array().into_iter().flatten() {
                totals.sum += n.as_u64().unwrap_or(0);
                totals.count += 1;
            }
            println!("Running sum: {} (count: {})", totals.sum, totals.count);
        }),
    )?;

    let restarts = runner.wait()?.into_result()?;

    let totals = totals.lock();
    println!("\n=== Final Results ===");
    println!("Total numbers processed: {}", totals.count);
    println!("Sum of all numbers: {}", totals.sum);
    if totals.count > 0 {
        println!("Average: {:.2}", totals.sum as f64 / totals.count as f64);
    }
    println!("Restarts: {}", restarts);
    println!("\nPipeline execution time: {:.3}s", start.elapsed().as_secs_f64());
    println!("{}", metrics::summary().format());

    Ok(())
}
