// Pipeline evaluation seam
// Conditions, mutations and iterate definitions are opaque pipeline
// definitions. They are compiled once by an Evaluator and run against the
// job context rendered as JSON.

pub mod path;

pub use path::PathEvaluator;

use crate::errors::EvaluationError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

type PipelineFn = dyn Fn(&Value) -> Result<Value, EvaluationError> + Send + Sync;

/// A compiled pipeline
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineFn>,
}

impl Pipeline {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, EvaluationError> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Run the pipeline with `input` as both root and starting value
    pub fn evaluate(&self, input: &Value) -> Result<Value, EvaluationError> {
        (self.inner)(input)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

/// Compiles declarative pipeline definitions. Implemented by the external
/// mapping engine; `PathEvaluator` is the bundled implementation.
pub trait Evaluator: Send + Sync {
    fn compile(&self, definition: &Value) -> Result<Pipeline, EvaluationError>;
}

/// Truthiness used by conditions: null, false, 0 and "" are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
