use crate::validator::ValidationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Could not synthesize a query for \"{question}\": {trace}")]
    SynthesisFailure { question: String, trace: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Query exceeded the {timeout_ms}ms execution ceiling")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::prelude::PolarsError> for EngineError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        EngineError::Polars(err.to_string())
    }
}

impl EngineError {
    /// Stable identifier used as `error_kind` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownMetric(_) => "unknown_metric",
            EngineError::SynthesisFailure { .. } => "synthesis_failure",
            EngineError::Validation(_) => "validation_error",
            EngineError::ExecutionTimeout { .. } => "execution_timeout",
            EngineError::Execution(_) | EngineError::Polars(_) => "execution_error",
            EngineError::Cancelled => "cancelled",
            EngineError::Generation(_) => "generation_error",
            EngineError::Dataset(_) => "dataset_error",
            EngineError::Config(_) | EngineError::Io(_) | EngineError::Json(_) => "internal_error",
        }
    }

    /// Message safe to show an end user. Never contains SQL text, schema
    /// details behind a rejection, or raw engine errors.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::UnknownMetric(metric) => {
                format!("Cannot compute requested metric '{}'.", metric)
            }
            EngineError::SynthesisFailure { question, .. } => format!(
                "I couldn't turn \"{}\" into a query. Try rephrasing it, e.g. name the metric and the time period explicitly.",
                question
            ),
            EngineError::Validation(_) => {
                "Could not safely process this question.".to_string()
            }
            EngineError::ExecutionTimeout { .. } => {
                "The query took too long to run. Try narrowing the time range or the breakdown.".to_string()
            }
            EngineError::Execution(_) | EngineError::Polars(_) => {
                "The query failed to run. Try rephrasing the question.".to_string()
            }
            EngineError::Cancelled => "The question was cancelled.".to_string(),
            EngineError::Generation(_) => {
                "The query generator is unavailable right now. Try a more specific question.".to_string()
            }
            EngineError::Dataset(_) => "No campaign dataset is loaded.".to_string(),
            EngineError::Config(_) | EngineError::Io(_) | EngineError::Json(_) => {
                "Internal error while answering the question.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
