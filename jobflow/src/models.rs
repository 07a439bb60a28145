// Data models for actions, responses and job definitions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Response Models
// ============================================================================

/// Status of a response. `Ok` and `Queued` are the only successes; `NoAction`
/// is a soft no-op that carries a warning instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Queued,
    NoAction,
    NotFound,
    BadRequest,
    NoAccess,
    Timeout,
    BadResponse,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Queued => "queued",
            Status::NoAction => "noaction",
            Status::NotFound => "notfound",
            Status::BadRequest => "badrequest",
            Status::NoAccess => "noaccess",
            Status::Timeout => "timeout",
            Status::BadResponse => "badresponse",
            Status::Error => "error",
        }
    }

    /// `ok` or `queued`
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok | Status::Queued)
    }

    /// Anything that is neither a success nor a `noaction`
    pub fn is_failure(&self) -> bool {
        !self.is_success() && *self != Status::NoAction
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response attached to an action after dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Response>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging: Option<Value>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            data: None,
            error: None,
            warning: None,
            origin: None,
            responses: None,
            paging: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }

    /// A response for `status` carrying `message`. `noaction` puts the
    /// message in `warning`, every other status puts it in `error`.
    pub fn with_message(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        let response = Self::new(status);
        if status == Status::NoAction {
            response.with_warning(message)
        } else {
            response.with_error(message)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_message(Status::Error, message)
    }

    pub fn noaction(message: impl Into<String>) -> Self {
        Self::with_message(Status::NoAction, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_responses(mut self, responses: Vec<Response>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// The error message, falling back to the warning
    pub fn message(&self) -> Option<&str> {
        self.error.as_deref().or(self.warning.as_deref())
    }
}

// ============================================================================
// Action Models
// ============================================================================

/// Metadata carried by every action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Identity of the caller. Opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ident: Option<Value>,
    /// Correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Group id, one per job run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<i64>,
    /// Any other transient flags
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A typed request with payload and metadata, optionally carrying the
/// response it got when dispatched. Builders consume and return a new value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Definition Models
// ============================================================================

/// Response used when a condition fails: a plain message or a response
/// literal whose missing status falls back to the condition list default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailResponse {
    Message(String),
    Response(FailResponseLiteral),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailResponseLiteral {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One declarative condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDefinition {
    pub condition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_response: Option<FailResponse>,
    #[serde(rename = "break", default, skip_serializing_if = "Option::is_none")]
    pub should_break: Option<bool>,
}

/// Pre- or postconditions, either as a list of conditions or in the legacy
/// form mapping a context path to a schema fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionsDefinition {
    Conditions(Vec<ConditionDefinition>),
    Schema(Map<String, Value>),
}

/// A step in a flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<ConditionsDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postconditions: Option<ConditionsDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premutation: Option<Value>,
    /// Legacy name for `premutation`, merges object mutations onto the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postmutation: Option<Value>,
    /// Legacy name for `postmutation`, merges object mutations onto the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mutation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterate_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterate_concurrency: Option<usize>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action: Some(action),
            ..Default::default()
        }
    }
}

/// An entry in a flow: one step, or a group of steps run in parallel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowEntry {
    Parallel(Vec<StepDefinition>),
    Step(Box<StepDefinition>),
}

impl From<StepDefinition> for FlowEntry {
    fn from(step: StepDefinition) -> Self {
        FlowEntry::Step(Box::new(step))
    }
}

/// A job: a single action or a flow of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<Vec<FlowEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postmutation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mutation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_error_in_postconditions: Option<bool>,
}

impl JobDefinition {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
