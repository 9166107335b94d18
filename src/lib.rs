//! Composable lazy data-processing pipelines.
//!
//! A [`Pipeline`] is an immutable, ordered list of stages bound to a
//! [`Source`]. Running it builds one pull-based iterator chain: no element is
//! produced until the caller asks for it, so memory stays bounded by what the
//! stages themselves buffer.
//!
//! # Features
//!
//! - Built-in stages: map, filter, flat-map, take, drop, deduplicate, tap
//! - Tumbling (count or duration) and sliding (count) windows
//! - Flow control: threshold backpressure buffering, size/timeout batching and
//!   bounded-parallel map with ordered output
//! - Lifecycle, error and backpressure events with prefix subscriptions and a
//!   process-wide counter store
//! - One-for-one supervised execution with restart budgets
//!
//! # Example
//!
//! ```ignore
//! use pipeflow::{Pipeline, RunOptions, Supervisor};
//! use serde_json::json;
//!
//! let pipeline = Pipeline::from_vec((1..=10).map(|n| json!(n)).collect())
//!     .map(|v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
//!     .tumbling(3)?;
//!
//! let windows = pipeline.collect()?;
//!
//! let supervisor = Supervisor::default();
//! let runner = supervisor.submit(pipeline, RunOptions::new().name("doubler"))?;
//! runner.wait()?;
//! ```

pub mod backpressure;
pub mod batch;
pub mod buffer;
pub mod error;
pub mod event;
pub mod flow;
pub mod metrics;
pub mod parallel;
pub mod pipeline;
pub mod source;
pub mod stage;
pub mod supervisor;
pub mod transform;
pub mod window;

// Re-exports for convenience
pub use backpressure::BackpressureStage;
pub use batch::BatchStage;
pub use buffer::RingBuffer;
pub use error::{BoxError, PipelineError, Result};
pub use event::{Event, EventBus, EventRecorder, EventSink};
pub use flow::{Flow, SourceAdapter};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use parallel::ParallelMapStage;
pub use pipeline::Pipeline;
pub use source::{FnSource, IterSource, Source, SourceIter, VecSource};
pub use stage::{Element, ElementStream, PassthroughStage, Stage, StageContext, StageOptions, StageSpec};
pub use supervisor::{
    RestartPolicy, RunOptions, RunnerExit, RunnerHandle, RunnerId, RunnerInfo, Supervisor,
    SupervisorConfig,
};
pub use transform::{DedupStage, DropStage, FilterStage, FlatMapStage, MapStage, TakeStage, TapStage};
pub use window::{WindowSpec, WindowStage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
