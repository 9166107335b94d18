use serde_json::Value;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type returned by user-supplied transforms, predicates and effects
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while building or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage option is missing or invalid
    #[error("Configuration error in {stage}: {message}")]
    Configuration { stage: String, message: String },

    /// A user-supplied transform or predicate failed on an element
    #[error("Stage {stage} failed on element {element}: {source}")]
    StageExecution {
        stage: String,
        element: Value,
        #[source]
        source: BoxError,
    },

    /// A flat-map transform returned something other than a finite sequence
    #[error("Stage {stage} returned {found} for element {element}, expected an array")]
    InvalidStageResult {
        stage: String,
        element: Value,
        found: String,
    },

    /// The pipeline was run without a bound source
    #[error("Cannot run a pipeline with no source")]
    MissingSource,

    /// The source cannot produce a (fresh) sequence
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A supervised runner terminated abnormally
    #[error("Runner crashed: {0}")]
    RunnerCrashed(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),
}

impl PipelineError {
    /// Build a configuration error for the given stage
    pub fn config(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// The element that triggered the failure, if any
    pub fn element(&self) -> Option<&Value> {
        match self {
            PipelineError::StageExecution { element, .. }
            | PipelineError::InvalidStageResult { element, .. } => Some(element),
            _ => None,
        }
    }

    /// The stage label the failure originated in, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Configuration { stage, .. }
            | PipelineError::StageExecution { stage, .. }
            | PipelineError::InvalidStageResult { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
