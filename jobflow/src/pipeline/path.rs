// Path based pipeline evaluator
//
// Definitions:
// - "a.b.0"        navigate from the current value
// - "^^a.b"        navigate from the root context
// - "." / null     the current value
// - [p1, p2, ...]  run pipelines in sequence, each on the previous result
// - { ".": p, "x.y": q }  template: start from p (or {}) and set each path
// - { "$value": v } / { "$not": p } / { "$eq": [p, v] } / { "$exists": p }

use super::{Evaluator, Pipeline};
use crate::errors::EvaluationError;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::instrument;

const ROOT_PREFIX: &str = "^^";

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Path { from_root: bool, segments: Vec<String> },
    Sequence(Vec<Op>),
    Template { base: Option<Box<Op>>, fields: Vec<(Vec<String>, Op)> },
    Literal(Value),
    Not(Box<Op>),
    Eq(Box<Op>, Value),
    Exists(Box<Op>),
}

/// Bundled evaluator for dot-path pipelines
#[derive(Debug, Clone, Default)]
pub struct PathEvaluator;

impl PathEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for PathEvaluator {
    #[instrument(skip(self))]
    fn compile(&self, definition: &Value) -> Result<Pipeline, EvaluationError> {
        let op = Arc::new(compile_op(definition)?);
        Ok(Pipeline::new(move |input| Ok(run(&op, input, input))))
    }
}

fn compile_op(definition: &Value) -> Result<Op, EvaluationError> {
    match definition {
        Value::Null => Ok(identity()),
        Value::String(path) => Ok(compile_path(path)),
        Value::Bool(_) | Value::Number(_) => Ok(Op::Literal(definition.clone())),
        Value::Array(steps) => Ok(Op::Sequence(
            steps.iter().map(compile_op).collect::<Result<_, _>>()?,
        )),
        Value::Object(fields) => compile_object(fields),
    }
}

fn identity() -> Op {
    Op::Path {
        from_root: false,
        segments: Vec::new(),
    }
}

fn compile_path(path: &str) -> Op {
    let (from_root, rest) = match path.strip_prefix(ROOT_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, path),
    };
    Op::Path {
        from_root,
        segments: split_path(rest),
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn compile_object(fields: &Map<String, Value>) -> Result<Op, EvaluationError> {
    if fields.len() == 1 {
        if let Some((key, arg)) = fields.iter().next() {
            if let Some(op) = compile_operator(key, arg)? {
                return Ok(op);
            }
        }
    }

    let mut base = None;
    let mut template = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        if key == "." {
            base = Some(Box::new(compile_op(value)?));
        } else {
            template.push((split_path(key), compile_op(value)?));
        }
    }
    Ok(Op::Template {
        base,
        fields: template,
    })
}

fn compile_operator(key: &str, arg: &Value) -> Result<Option<Op>, EvaluationError> {
    let op = match key {
        "$value" => Op::Literal(arg.clone()),
        "$not" => Op::Not(Box::new(compile_op(arg)?)),
        "$exists" => Op::Exists(Box::new(compile_op(arg)?)),
        "$eq" => match arg.as_array().map(Vec::as_slice) {
            Some([pipeline, expected]) => {
                Op::Eq(Box::new(compile_op(pipeline)?), expected.clone())
            }
            _ => {
                return Err(EvaluationError::InvalidDefinition(
                    "'$eq' expects [pipeline, value]".to_string(),
                ))
            }
        },
        // "$action" is a context key, not an operator
        "$action" => return Ok(None),
        other if other.starts_with('$') => {
            return Err(EvaluationError::UnknownOperator(other.to_string()))
        }
        _ => return Ok(None),
    };
    Ok(Some(op))
}

fn run(op: &Op, root: &Value, current: &Value) -> Value {
    match op {
        Op::Path {
            from_root,
            segments,
        } => {
            let start = if *from_root { root } else { current };
            get_path(start, segments).cloned().unwrap_or(Value::Null)
        }
        Op::Sequence(ops) => ops
            .iter()
            .fold(current.clone(), |value, op| run(op, root, &value)),
        Op::Template { base, fields } => {
            let mut target = match base {
                Some(base) => run(base, root, current),
                None => Value::Object(Map::new()),
            };
            for (path, op) in fields {
                let value = run(op, root, current);
                set_path(&mut target, path, value);
            }
            target
        }
        Op::Literal(value) => value.clone(),
        Op::Not(inner) => Value::Bool(!super::is_truthy(&run(inner, root, current))),
        Op::Eq(inner, expected) => Value::Bool(run(inner, root, current) == *expected),
        Op::Exists(inner) => Value::Bool(!run(inner, root, current).is_null()),
    }
}

/// Navigate a dot path. Numeric segments index into arrays.
pub fn get_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = value;

    for part in path {
        let part = part.as_ref();
        current = match current {
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            Value::Object(fields) => fields.get(part)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Set a value at a dot path, creating objects on the way
pub fn set_path<S: AsRef<str>>(target: &mut Value, path: &[S], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return;
    };

    let mut current = target;
    for part in parents {
        current = ensure_object(current)
            .entry(part.as_ref().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.as_ref().to_string(), value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
