use crate::backpressure::BackpressureStage;
use crate::batch::BatchStage;
use crate::error::{BoxError, PipelineError, Result};
use crate::event::{global_bus, Emitter, EventSink};
use crate::flow::{Flow, SourceAdapter, StageProbe, UpstreamMark};
use crate::parallel::ParallelMapStage;
use crate::source::{IterSource, Source, VecSource};
use crate::stage::{Element, ElementStream, Stage, StageContext, StageOptions, StageSpec};
use crate::transform::{DedupStage, DropStage, FilterStage, FlatMapStage, MapStage, TakeStage, TapStage};
use crate::window::{WindowSpec, WindowStage};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// An immutable, ordered composition of stages over an optional source
///
/// Every composition method returns a new `Pipeline` with one stage appended;
/// the receiver is left untouched. Nothing runs until [`Pipeline::run`].
///
/// ```ignore
/// use pipeflow::Pipeline;
/// use serde_json::json;
///
/// let out = Pipeline::from_vec((1..=10).map(|n| json!(n)).collect())
///     .filter(|v| Ok(v.as_i64().unwrap_or(0) % 2 == 0))
///     .map(|v| Ok(json!(v.as_i64().unwrap_or(0) * 10)))
///     .batch(2, Duration::from_secs(1))
///     .collect()?;
/// ```
#[derive(Clone)]
pub struct Pipeline {
    name: Arc<str>,
    source: Option<Arc<dyn Source>>,
    stages: Vec<StageSpec>,
    options: Map<String, Value>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Pipeline {
    /// Create an empty pipeline with no source
    pub fn new() -> Self {
        Self {
            name: Arc::from("pipeline"),
            source: None,
            stages: Vec::new(),
            options: Map::new(),
            sink: None,
        }
    }

    /// Create an empty pipeline bound to `source`
    pub fn from_source(source: impl Source) -> Self {
        Self::new().with_source(source)
    }

    /// Create a pipeline over a one-shot iterator
    pub fn from_iterator<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Element>,
        I::IntoIter: Send + 'static,
    {
        Self::from_source(IterSource::new(iter))
    }

    /// Create a pipeline over a replayable list of elements
    pub fn from_vec(elements: Vec<Element>) -> Self {
        Self::from_source(VecSource::new(elements))
    }

    /// Bind (or rebind) the source
    pub fn with_source(&self, source: impl Source) -> Self {
        self.with_shared_source(Arc::new(source))
    }

    /// Bind a source that is already shared
    pub fn with_shared_source(&self, source: Arc<dyn Source>) -> Self {
        let mut next = self.clone();
        next.source = Some(source);
        next
    }

    /// Name used in events and logs for this pipeline
    pub fn with_name(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.name = Arc::from(name);
        next
    }

    /// Set an entry of the pipeline configuration map
    pub fn with_option(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.options.insert(key.to_string(), value.into());
        next
    }

    /// Send this pipeline's events to `sink` instead of the global bus
    pub fn with_sink(&self, sink: Arc<dyn EventSink>) -> Self {
        let mut next = self.clone();
        next.sink = Some(sink);
        next
    }

    /// Append a stage with its options
    pub fn stage(&self, stage: impl Stage, options: StageOptions) -> Self {
        self.push(StageSpec::new(Arc::new(stage), options))
    }

    fn push(&self, spec: StageSpec) -> Self {
        let mut next = self.clone();
        next.stages.push(spec);
        next
    }

    /// Transform every element; an error ends the run
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync + 'static,
    {
        self.stage(MapStage::new(f), StageOptions::new())
    }

    /// Keep elements matching `predicate`; an error ends the run
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.stage(FilterStage::new(predicate), StageOptions::new())
    }

    /// `f` must return an array; its items are emitted in order
    pub fn flat_map<F>(&self, f: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync + 'static,
    {
        self.stage(FlatMapStage::new(f), StageOptions::new())
    }

    /// Emit at most `count` elements, then stop pulling the source
    pub fn take(&self, count: usize) -> Self {
        self.stage(TakeStage, StageOptions::new().with("count", count))
    }

    /// Discard the first `count` elements
    pub fn skip(&self, count: usize) -> Self {
        self.stage(DropStage, StageOptions::new().with("count", count))
    }

    /// Drop consecutive duplicates
    pub fn dedup(&self) -> Self {
        self.stage(DedupStage::new(), StageOptions::new())
    }

    /// Drop consecutive elements whose key equals the last emitted key
    pub fn dedup_by<F>(&self, key: F) -> Self
    where
        F: Fn(&Element) -> Element + Send + Sync + 'static,
    {
        self.stage(DedupStage::by_key(key), StageOptions::new())
    }

    /// Run `effect` per element; its failures are reported, not fatal
    pub fn tap<F>(&self, effect: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.stage(TapStage::new(effect), StageOptions::new())
    }

    /// Append a window stage configured from raw options, validating them now
    pub fn window(&self, options: StageOptions) -> Result<Self> {
        WindowSpec::from_options(&options)?;
        Ok(self.stage(WindowStage, options))
    }

    /// Non-overlapping windows of `size` elements
    pub fn tumbling(&self, size: usize) -> Result<Self> {
        self.window(WindowSpec::TumblingCount { size }.to_options())
    }

    /// Non-overlapping windows spanning `duration` from their first element
    pub fn tumbling_duration(&self, duration: Duration) -> Result<Self> {
        self.window(WindowSpec::TumblingDuration { duration }.to_options())
    }

    /// Overlapping windows of `size` elements advancing by `slide`
    pub fn sliding(&self, size: usize, slide: usize) -> Result<Self> {
        self.window(WindowSpec::Sliding { size, slide }.to_options())
    }

    /// Group elements into batches of `size`, released early after `timeout`
    pub fn batch(&self, size: usize, timeout: Duration) -> Self {
        self.stage(
            BatchStage,
            StageOptions::new()
                .with("size", size)
                .with("timeout_us", timeout.as_micros() as u64),
        )
    }

    /// Buffer up to `max_buffer` elements, releasing them in bursts
    pub fn backpressure(&self, max_buffer: usize) -> Self {
        self.stage(BackpressureStage, StageOptions::new().with("max_buffer", max_buffer))
    }

    /// Map on up to `parallelism` concurrent workers, keeping input order
    pub fn parallel_map<F>(&self, parallelism: usize, f: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync + 'static,
    {
        self.stage(
            ParallelMapStage::new(f),
            StageOptions::new().with("parallelism", parallelism),
        )
    }

    /// The pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a source is bound
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// The stages in execution order
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// The pipeline configuration map
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// One label per stage, in execution order
    pub fn describe(&self) -> Vec<String> {
        self.stages.iter().map(StageSpec::describe).collect()
    }

    fn emitter(&self) -> Emitter {
        let sink: Arc<dyn EventSink> = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => global_bus(),
        };
        Emitter::new(sink, Arc::clone(&self.name))
    }

    /// Build the lazy execution graph.
    ///
    /// Stages are folded left to right over the source adapter. Each stage's
    /// `process` runs here, so option errors surface before any element
    /// flows; the source itself is not opened until the first pull.
    pub fn run(&self) -> Result<Flow> {
        let source = self.source.as_ref().ok_or(PipelineError::MissingSource)?;
        let events = self.emitter();

        let mut stream: ElementStream =
            Box::new(SourceAdapter::new(Arc::clone(source), events.clone()));
        for (index, spec) in self.stages.iter().enumerate() {
            let label = spec.describe();
            let ctx = StageContext::new(index, label.clone(), spec.options().clone(), events.clone());
            let upstream_failed = Arc::new(AtomicBool::new(false));
            let input: ElementStream = Box::new(UpstreamMark::new(stream, Arc::clone(&upstream_failed)));
            let output = spec.stage().process(input, &ctx)?;
            stream = Box::new(StageProbe::new(output, label, index, events.clone(), upstream_failed));
        }
        Ok(Flow::new(stream, self.stages.len(), events))
    }

    /// Run to completion, collecting every element or the first error
    pub fn collect(&self) -> Result<Vec<Element>> {
        self.run()?.collect()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("source", &self.source.as_ref().map(|s| s.describe()))
            .field("stages", &self.describe())
            .field("options", &self.options)
            .finish()
    }
}
