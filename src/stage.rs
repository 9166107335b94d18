use crate::error::{PipelineError, Result};
use crate::event::Emitter;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The dynamic element type flowing through a pipeline
pub type Element = Value;

/// A lazy, pull-based element sequence.
///
/// Each `next()` is one pull. An `Err` item is fatal: a well-behaved stream
/// yields nothing after it.
pub type ElementStream = Box<dyn Iterator<Item = Result<Element>> + Send>;

/// Trait for a processing stage in the pipeline
///
/// `process` must be non-strict: it wraps `input` and returns immediately,
/// doing per-element work only when the returned stream is pulled.
pub trait Stage: Send + Sync + 'static {
    /// Wrap the upstream sequence into this stage's output sequence
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream>;

    /// Human-readable description of this stage
    fn describe(&self) -> String;
}

/// Configuration options of one stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOptions {
    values: Map<String, Value>,
}

impl StageOptions {
    /// Create an empty option set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option, returning the updated set
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Raw option value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether `key` is set
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Whether no option is set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read a non-negative integer option, failing if present but invalid
    pub fn optional_usize(&self, stage: &str, key: &str) -> Result<Option<usize>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| {
                    PipelineError::config(
                        stage,
                        format!("option `{key}` must be a non-negative integer, got {value}"),
                    )
                }),
        }
    }

    /// Read a required non-negative integer option
    pub fn require_usize(&self, stage: &str, key: &str) -> Result<usize> {
        self.optional_usize(stage, key)?
            .ok_or_else(|| PipelineError::config(stage, format!("missing required option `{key}`")))
    }

    /// Read a required positive integer option
    pub fn require_positive(&self, stage: &str, key: &str) -> Result<usize> {
        match self.require_usize(stage, key)? {
            0 => Err(PipelineError::config(
                stage,
                format!("option `{key}` must be greater than zero"),
            )),
            n => Ok(n),
        }
    }

    /// Read an optional positive integer option, falling back to `default`
    pub fn positive_or(&self, stage: &str, key: &str, default: usize) -> Result<usize> {
        if self.contains(key) {
            self.require_positive(stage, key)
        } else {
            Ok(default)
        }
    }

    /// Read a positive duration given as `<key>_us` or `<key>_ms`.
    /// Microseconds take precedence when both are set.
    pub fn optional_duration(&self, stage: &str, key: &str) -> Result<Option<Duration>> {
        let micros = format!("{key}_us");
        if self.contains(&micros) {
            let n = self.require_positive(stage, &micros)?;
            return Ok(Some(Duration::from_micros(n as u64)));
        }
        let millis = format!("{key}_ms");
        if self.contains(&millis) {
            let n = self.require_positive(stage, &millis)?;
            return Ok(Some(Duration::from_millis(n as u64)));
        }
        Ok(None)
    }

    /// Read an optional string option
    pub fn optional_str(&self, stage: &str, key: &str) -> Result<Option<&str>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(PipelineError::config(
                stage,
                format!("option `{key}` must be a string, got {other}"),
            )),
        }
    }
}

/// Per-run context handed to a stage's `process`
#[derive(Debug, Clone)]
pub struct StageContext {
    index: usize,
    label: String,
    options: StageOptions,
    events: Emitter,
}

impl StageContext {
    /// Create the context of the stage at `index`
    pub fn new(index: usize, label: String, options: StageOptions, events: Emitter) -> Self {
        Self {
            index,
            label,
            options,
            events,
        }
    }

    /// Position of the stage in its pipeline
    pub fn index(&self) -> usize {
        self.index
    }

    /// Stage description, used in errors and events
    pub fn label(&self) -> &str {
        &self.label
    }

    /// This stage's options
    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// Emitter for this run's events
    pub fn events(&self) -> &Emitter {
        &self.events
    }
}

/// A stage implementation together with its configuration
#[derive(Clone)]
pub struct StageSpec {
    stage: Arc<dyn Stage>,
    options: StageOptions,
}

impl StageSpec {
    /// Pair a stage with its options
    pub fn new(stage: Arc<dyn Stage>, options: StageOptions) -> Self {
        Self { stage, options }
    }

    /// The stage implementation
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// The stage's label
    pub fn describe(&self) -> String {
        self.stage.describe()
    }
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("stage", &self.stage.describe())
            .field("options", &self.options)
            .finish()
    }
}

/// A pass-through stage, handy as a placeholder or in tests
#[derive(Debug)]
pub struct PassthroughStage;

impl Stage for PassthroughStage {
    fn process(&self, input: ElementStream, _ctx: &StageContext) -> Result<ElementStream> {
        Ok(input)
    }

    fn describe(&self) -> String {
        "passthrough".to_string()
    }
}

/// Stop a stream after its first error
pub(crate) struct Fused {
    inner: ElementStream,
    done: bool,
}

impl Fused {
    pub(crate) fn new(inner: ElementStream) -> Self {
        Self { inner, done: false }
    }

    /// Pull the next upstream item, ending the stream after an error
    pub(crate) fn pull(&mut self) -> Option<Result<Element>> {
        if self.done {
            return None;
        }
        let item = self.inner.next();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }

    pub(crate) fn finish(&mut self) {
        self.done = true;
    }
}
