use crate::event::{
    global_bus, Event, EventBus, EventSink, BACKPRESSURE, PIPELINE_COMPLETE, PIPELINE_START,
    STAGE_ERROR, STAGE_STOP,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// The most recent pipeline durations, for percentile reads
#[derive(Debug)]
struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn record(&self, micros: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    /// Nearest-rank percentile in milliseconds, 0 when nothing was recorded
    fn percentile_ms(&self, p: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * p).ceil() as usize).clamp(1, sorted.len());
        sorted[rank - 1] as f64 / 1000.0
    }

    fn clear(&self) {
        self.samples.lock().clear();
    }
}

/// Counter store fed by pipeline events
///
/// Every counter is an independent atomic, so concurrent runners can feed the
/// same store without coordination.
#[derive(Debug)]
pub struct PipelineMetrics {
    pipelines_started: AtomicU64,
    pipelines_completed: AtomicU64,
    elements_processed: AtomicU64,
    errors: AtomicU64,
    backpressure_events: AtomicU64,
    duration_total_us: AtomicU64,
    duration_count: AtomicU64,
    latencies: LatencyWindow,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            pipelines_started: AtomicU64::new(0),
            pipelines_completed: AtomicU64::new(0),
            elements_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            duration_total_us: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
            latencies: LatencyWindow::new(1000),
        }
    }

    /// Record a pipeline run's duration in microseconds
    pub fn record_duration(&self, micros: u64) {
        self.duration_total_us.fetch_add(micros, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.latencies.record(micros);
    }

    /// Mean pipeline duration in milliseconds
    pub fn average_latency_ms(&self) -> f64 {
        let count = self.duration_count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.duration_total_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
        }
    }

    /// Get a snapshot of current metrics
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            pipelines_started: self.pipelines_started.load(Ordering::Relaxed),
            pipelines_completed: self.pipelines_completed.load(Ordering::Relaxed),
            total_elements_processed: self.elements_processed.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            latency_p50_ms: self.latencies.percentile_ms(0.50),
            latency_p95_ms: self.latencies.percentile_ms(0.95),
            latency_p99_ms: self.latencies.percentile_ms(0.99),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.pipelines_started,
            &self.pipelines_completed,
            &self.elements_processed,
            &self.errors,
            &self.backpressure_events,
            &self.duration_total_us,
            &self.duration_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latencies.clear();
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for PipelineMetrics {
    fn emit(&self, event: &Event) {
        match event.name {
            name if name == PIPELINE_START => {
                self.pipelines_started.fetch_add(1, Ordering::Relaxed);
            }
            name if name == PIPELINE_COMPLETE => {
                self.pipelines_completed.fetch_add(1, Ordering::Relaxed);
                if let Some(duration) = event.measurement_u64("duration") {
                    self.record_duration(duration);
                }
            }
            name if name == STAGE_STOP => {
                let count = event.measurement_u64("element_count").unwrap_or(0);
                self.elements_processed.fetch_add(count, Ordering::Relaxed);
            }
            name if name == STAGE_ERROR => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            name if name == BACKPRESSURE => {
                self.backpressure_events.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// A snapshot of the counter store at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub pipelines_started: u64,
    pub pipelines_completed: u64,
    pub total_elements_processed: u64,
    pub total_errors: u64,
    /// Mean pipeline duration in milliseconds
    pub average_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub backpressure_events: u64,
}

impl MetricsSummary {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Started: {}, Completed: {}, Elements: {}, Errors: {}, Backpressure: {}, \
             Latency avg: {:.2}ms, P50: {:.2}ms, P95: {:.2}ms, P99: {:.2}ms",
            self.pipelines_started,
            self.pipelines_completed,
            self.total_elements_processed,
            self.total_errors,
            self.backpressure_events,
            self.average_latency_ms,
            self.latency_p50_ms,
            self.latency_p95_ms,
            self.latency_p99_ms,
        )
    }
}

static GLOBAL_METRICS: OnceLock<Arc<PipelineMetrics>> = OnceLock::new();

fn store() -> &'static Arc<PipelineMetrics> {
    GLOBAL_METRICS.get_or_init(|| Arc::new(PipelineMetrics::new()))
}

/// Subscribe the process-wide store to `bus`. Runs once, as the global bus
/// is created.
pub(crate) fn attach(bus: &EventBus) {
    let sink = Arc::clone(store());
    bus.subscribe(&["pipeline"], move |event| sink.emit(event));
}

/// The process-wide counter store, fed by the global event bus
pub fn global() -> Arc<PipelineMetrics> {
    global_bus();
    Arc::clone(store())
}

/// Summary of the process-wide counter store
pub fn summary() -> MetricsSummary {
    global().summary()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_percentiles() {
        let window = LatencyWindow::new(10);
        assert_eq!(window.percentile_ms(0.5), 0.0);
        for i in 1..=10 {
            window.record(i * 1000);
        }
        assert_eq!(window.percentile_ms(0.50), 5.0);
        assert_eq!(window.percentile_ms(0.95), 10.0);
        assert_eq!(window.percentile_ms(0.99), 10.0);
    }

    #[test]
    fn test_latency_window_keeps_most_recent() {
        let window = LatencyWindow::new(3);
        for micros in [9000, 1000, 2000, 3000] {
            window.record(micros);
        }
        assert_eq!(window.percentile_ms(0.99), 3.0);
        window.clear();
        assert_eq!(window.percentile_ms(0.99), 0.0);
    }

    #[test]
    fn test_counts_events() {
        let metrics = PipelineMetrics::new();
        metrics.emit(&Event::new(PIPELINE_START));
        metrics.emit(&Event::new(PIPELINE_COMPLETE).measure("duration", 2000));
        metrics.emit(&Event::new(PIPELINE_COMPLETE).measure("duration", 4000));
        metrics.emit(&Event::new(STAGE_STOP).measure("element_count", 7));
        metrics.emit(&Event::new(STAGE_ERROR));
        metrics.emit(&Event::new(BACKPRESSURE).measure("buffer_size", 3));

        let summary = metrics.summary();
        assert_eq!(summary.pipelines_started, 1);
        assert_eq!(summary.pipelines_completed, 2);
        assert_eq!(summary.total_elements_processed, 7);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.backpressure_events, 1);
        assert!((summary.average_latency_ms - 3.0).abs() < f64::EPSILON);

        metrics.reset();
        assert_eq!(metrics.summary().pipelines_completed, 0);
        assert_eq!(metrics.summary().average_latency_ms, 0.0);
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.emit(&Event::new(STAGE_STOP).measure("element_count", 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.summary().total_elements_processed, 8000);
    }

    #[test]
    fn test_global_store_is_shared() {
        assert!(Arc::ptr_eq(&global(), &global()));
        assert!(global_bus().subscriber_count() >= 1);
    }
}
