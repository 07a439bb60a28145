// Condition validation for step pre- and postconditions

use super::aggregate::unify_status;
use crate::errors::JobError;
use crate::models::{ConditionsDefinition, FailResponse, Response, Status};
use crate::pipeline::path::get_path;
use crate::pipeline::{is_truthy, Evaluator, Pipeline};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

const DEFAULT_FAIL_MESSAGE: &str = "Did not satisfy condition";

/// Where a condition list is used. Decides the default fail status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Pre,
    Post,
}

impl ConditionKind {
    pub fn default_status(&self) -> Status {
        match self {
            ConditionKind::Pre => Status::NoAction,
            ConditionKind::Post => Status::Error,
        }
    }
}

/// Verdict of a condition list. `response` is set when any condition failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub response: Option<Response>,
    pub should_break: bool,
}

impl ConditionOutcome {
    pub fn passed() -> Self {
        Self {
            response: None,
            should_break: false,
        }
    }

    pub fn failed(response: Response, should_break: bool) -> Self {
        Self {
            response: Some(response),
            should_break,
        }
    }
}

#[derive(Debug)]
enum Condition {
    Pipeline {
        pipeline: Pipeline,
        fail_response: Option<FailResponse>,
        should_break: bool,
    },
    Schema {
        path: String,
        schema: Value,
    },
}

/// A compiled list of conditions
#[derive(Debug)]
pub struct Conditions {
    kind: ConditionKind,
    conditions: Vec<Condition>,
}

impl Conditions {
    pub fn compile(
        definition: &ConditionsDefinition,
        kind: ConditionKind,
        evaluator: &dyn Evaluator,
        location: &str,
    ) -> Result<Self, JobError> {
        let conditions = match definition {
            ConditionsDefinition::Conditions(list) => list
                .iter()
                .enumerate()
                .map(|(index, def)| -> Result<Condition, JobError> {
                    let pipeline = evaluator.compile(&def.condition).map_err(|e| {
                        JobError::pipeline(format!("{} condition {}", location, index), e)
                    })?;
                    Ok(Condition::Pipeline {
                        pipeline,
                        fail_response: def.fail_response.clone(),
                        should_break: def.should_break.unwrap_or(false),
                    })
                })
                .collect::<Result<Vec<_>, JobError>>()?,
            ConditionsDefinition::Schema(fields) => fields
                .iter()
                .map(|(path, schema)| Condition::Schema {
                    path: path.clone(),
                    schema: schema.clone(),
                })
                .collect(),
        };

        Ok(Self { kind, conditions })
    }

    /// Evaluate every condition against `context`. All failures are combined.
    #[instrument(skip_all, fields(kind = ?self.kind, count = self.conditions.len()))]
    pub fn validate(&self, context: &Value) -> ConditionOutcome {
        let default_status = self.kind.default_status();
        let mut failures = Vec::new();
        let mut should_break = false;

        for condition in &self.conditions {
            match condition {
                Condition::Pipeline {
                    pipeline,
                    fail_response,
                    should_break: break_on_fail,
                } => {
                    let passed = match pipeline.evaluate(context) {
                        Ok(value) => is_truthy(&value),
                        Err(e) => {
                            debug!(error = %e, "Condition could not be evaluated");
                            false
                        }
                    };
                    if !passed {
                        failures.push(fail_response_for(fail_response.as_ref(), default_status));
                        should_break |= *break_on_fail;
                    }
                }
                Condition::Schema { path, schema } => {
                    let segments: Vec<&str> = path
                        .trim_start_matches("^^")
                        .split('.')
                        .filter(|s| !s.is_empty())
                        .collect();
                    let value = get_path(context, &segments);
                    // The schema form always fails soft, pre or post
                    if !matches_schema(value, schema) {
                        failures.push(Response::with_message(
                            Status::NoAction,
                            format!("'{}' did not pass {}", path, schema),
                        ));
                    }
                }
            }
        }

        match failures.len() {
            0 => ConditionOutcome::passed(),
            1 => ConditionOutcome::failed(failures.remove(0), should_break),
            _ => ConditionOutcome::failed(combine_failures(failures), should_break),
        }
    }
}

fn fail_response_for(fail_response: Option<&FailResponse>, default_status: Status) -> Response {
    match fail_response {
        None => Response::with_message(default_status, DEFAULT_FAIL_MESSAGE),
        Some(FailResponse::Message(message)) => Response::with_message(default_status, message),
        Some(FailResponse::Response(literal)) => {
            let status = literal.status.unwrap_or(default_status);
            let mut response = Response::new(status);
            response.error = literal.error.clone();
            response.warning = literal.warning.clone();
            response.data = literal.data.clone();
            if response.message().is_none() {
                response = Response::with_message(status, DEFAULT_FAIL_MESSAGE);
                response.data = literal.data.clone();
            }
            response
        }
    }
}

fn combine_failures(failures: Vec<Response>) -> Response {
    let status = unify_status(failures.iter().map(|r| &r.status));
    let mut response = Response::new(status);

    let errors: Vec<&str> = failures
        .iter()
        .filter(|r| r.status != Status::NoAction)
        .filter_map(|r| r.message())
        .collect();
    let warnings: Vec<&str> = failures
        .iter()
        .filter(|r| r.status == Status::NoAction)
        .filter_map(|r| r.message())
        .collect();

    if !errors.is_empty() {
        response.error = Some(errors.join(", "));
    }
    if !warnings.is_empty() {
        response.warning = Some(warnings.join(", "));
    }
    response
}

/// Validate a value against a small JSON schema fragment: `type`, `const`,
/// `enum`, `minLength`, `maxLength`, `minimum`, `maximum`, `minItems`.
/// A missing value only passes an empty fragment.
pub fn matches_schema(value: Option<&Value>, schema: &Value) -> bool {
    let Some(fragment) = schema.as_object() else {
        // `true` accepts anything, `false` nothing
        return schema.as_bool().unwrap_or(true);
    };
    if fragment.is_empty() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };

    matches_type(value, fragment)
        && fragment.get("const").map_or(true, |expected| expected == value)
        && fragment
            .get("enum")
            .and_then(Value::as_array)
            .map_or(true, |options| options.contains(value))
        && check_length(value, fragment)
        && check_range(value, fragment)
}

fn matches_type(value: &Value, fragment: &Map<String, Value>) -> bool {
    match fragment.get("type") {
        None => true,
        Some(Value::String(name)) => is_type(value, name),
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(value, name)),
        Some(_) => false,
    }
}

fn is_type(value: &Value, name: &str) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn check_length(value: &Value, fragment: &Map<String, Value>) -> bool {
    let min_length = fragment.get("minLength").and_then(Value::as_u64);
    let max_length = fragment.get("maxLength").and_then(Value::as_u64);
    let min_items = fragment.get("minItems").and_then(Value::as_u64);

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if min_length.is_some_and(|min| len < min) || max_length.is_some_and(|max| len > max) {
            return false;
        }
    }
    if let Some(items) = value.as_array() {
        if min_items.is_some_and(|min| (items.len() as u64) < min) {
            return false;
        }
    }
    true
}

fn check_range(value: &Value, fragment: &Map<String, Value>) -> bool {
    let Some(number) = value.as_f64() else {
        return true;
    };
    let minimum = fragment.get("minimum").and_then(Value::as_f64);
    let maximum = fragment.get("maximum").and_then(Value::as_f64);
    !(minimum.is_some_and(|min| number < min) || maximum.is_some_and(|max| number > max))
}
