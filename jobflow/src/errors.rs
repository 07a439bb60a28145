// Error handling framework
// Runtime failures inside a job run are responses, not errors. These types
// cover construction-time and configuration problems only.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid instant '{value}': {reason}")]
    InvalidInstant { value: String, reason: String },

    #[error("Invalid schedule window: end {end} is before start {start}")]
    InvalidWindow { start: String, end: String },
}

/// Pipeline compile and evaluation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown pipeline operator: {0}")]
    UnknownOperator(String),

    #[error("Pipeline evaluation failed: {0}")]
    EvaluationFailed(String),
}

/// Errors raised while compiling a job definition into a runnable job
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job definition: {0}")]
    InvalidDefinition(String),

    #[error("Step '{step_id}' sets both '{legacy}' and '{modern}'")]
    ConflictingFields {
        step_id: String,
        legacy: &'static str,
        modern: &'static str,
    },

    #[error("Step id '{0}' is reserved or contains ':'")]
    ReservedStepId(String),

    #[error("Failed to compile pipeline for '{location}': {source}")]
    Pipeline {
        location: String,
        #[source]
        source: EvaluationError,
    },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl JobError {
    pub(crate) fn pipeline(location: impl Into<String>, source: EvaluationError) -> Self {
        JobError::Pipeline {
            location: location.into(),
            source,
        }
    }
}
