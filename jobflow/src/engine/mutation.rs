// Action mutation through compiled pipelines

use super::context::{context_to_value, ContextMap, CURRENT_ACTION_KEY};
use crate::errors::{EvaluationError, JobError};
use crate::models::Action;
use crate::pipeline::{Evaluator, Pipeline};
use serde_json::Value;
use tracing::instrument;

/// A mutation definition with its legacy form resolved
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDefinition {
    pub pipeline: Value,
    /// Merge the pipeline output onto the action instead of replacing it.
    /// Only object mutations given under a legacy field name merge.
    pub merge: bool,
}

/// Resolve the modern and legacy field names of one mutation. Setting both
/// is rejected.
pub fn resolve(
    modern: Option<&Value>,
    legacy: Option<&Value>,
    owner_id: &str,
    names: (&'static str, &'static str),
) -> Result<Option<MutationDefinition>, JobError> {
    let (legacy_name, modern_name) = names;
    match (modern, legacy) {
        (Some(_), Some(_)) => Err(JobError::ConflictingFields {
            step_id: owner_id.to_string(),
            legacy: legacy_name,
            modern: modern_name,
        }),
        (Some(pipeline), None) => Ok(Some(MutationDefinition {
            pipeline: pipeline.clone(),
            merge: false,
        })),
        (None, Some(pipeline)) => Ok(Some(MutationDefinition {
            pipeline: pipeline.clone(),
            merge: pipeline.is_object(),
        })),
        (None, None) => Ok(None),
    }
}

/// Mutates an action with the context in scope
#[derive(Debug, Clone)]
pub struct Mutator {
    pipeline: Pipeline,
    merge: bool,
}

impl Mutator {
    /// Compile a mutation. The pipeline starts from the current action, looked
    /// up in the context, so `^^` paths still reach every step result.
    pub fn compile(
        definition: &MutationDefinition,
        evaluator: &dyn Evaluator,
        location: &str,
    ) -> Result<Self, JobError> {
        let mut steps = vec![Value::String(CURRENT_ACTION_KEY.to_string())];
        match &definition.pipeline {
            Value::Array(items) => steps.extend(items.iter().cloned()),
            other => steps.push(other.clone()),
        }

        let pipeline = evaluator
            .compile(&Value::Array(steps))
            .map_err(|e| JobError::pipeline(location, e))?;

        Ok(Self {
            pipeline,
            merge: definition.merge,
        })
    }

    #[instrument(skip_all, fields(action_type = %action.action_type, merge = self.merge))]
    pub fn mutate(&self, action: &Action, context: &ContextMap) -> Result<Action, EvaluationError> {
        let input = context_to_value(context, Some(action));
        let output = self.pipeline.evaluate(&input)?;

        let output = if self.merge {
            let mut merged = action.to_value();
            merge_value(&mut merged, output);
            merged
        } else {
            output
        };

        serde_json::from_value(output).map_err(|e| {
            EvaluationError::EvaluationFailed(format!("Mutation did not produce an action: {}", e))
        })
    }
}

/// Deep merge `source` onto `target`. Objects merge key by key, anything else
/// replaces the target value.
fn merge_value(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}
