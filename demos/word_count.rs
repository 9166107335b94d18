//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits into words, counts frequencies, and prints
//! the running top-10 every 100 words.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use parking_lot::Mutex;
use pipeflow::{metrics, Element, Pipeline};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::Arc;

fn top_n(counts: &HashMap<String, usize>, n: usize) -> Vec<(String, usize)> {
    let mut items: Vec<_> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    items.into_iter().take(n).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let lines: Vec<Element> = io::stdin()
        .lock()
        .lines()
        .collect::<io::Result<Vec<String>>>()?
        .into_iter()
        .map(Value::String)
        .collect();

    let counts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let counter = Arc::clone(&counts);

    let pipeline = Pipeline::from_vec(lines)
        .with_name("word_count")
        .flat_map(|line| {
            let words: Vec<Value> = line
                .as_str()
                .unwrap_or_default()
                .split_whitespace()
                .map(|w| json!(w.to_lowercase()))
                .collect();
            Ok(Value::Array(words))
        })
        .map(|word| {
            let cleaned: String = word
                .as_str()
                .unwrap_or_default()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect();
            Ok(json!(cleaned))
        })
        .filter(|word| Ok(word.as_str().map_or(0, str::len) > 2))
        .tumbling(100)?
        .tap(move |window| {
            let mut counts = counter.lock();
            for word in window.as_array().into_iter().flatten() {
                if let Some(word) = word.as_str() {
                    *counts.entry(word.to_string()).or_insert(0) += 1;
                }
            }
            let total: usize = counts.values().sum();
            println!("\n=== Top 10 Words (after {} words) ===", total);
            for (i, (word, count)) in top_n(&counts, 10).iter().enumerate() {
                println!("{:2}. {} ({})", i + 1, word, count);
            }
            Ok(())
        });

    let windows = pipeline.collect()?;

    println!("\n\nProcessing complete! {} windows", windows.len());
    println!("{}", metrics::summary().format());

    Ok(())
}
