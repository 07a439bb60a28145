// Combining sibling responses into one verdict

use crate::models::{Response, Status};
use serde_json::Value;

/// Unify statuses: `ok` if there are no failures (`queued` counts as `ok`),
/// the shared failure status if all failures agree, otherwise `error`. `noaction` never counts as a
/// failure, but a set of only `noaction` stays `noaction`.
pub fn unify_status<'a>(statuses: impl IntoIterator<Item = &'a Status>) -> Status {
    let statuses: Vec<Status> = statuses.into_iter().copied().collect();
    let mut failures = statuses.iter().filter(|status| status.is_failure());

    match failures.next() {
        Some(first) => {
            if failures.all(|status| status == first) {
                *first
            } else {
                Status::Error
            }
        }
        None if !statuses.is_empty() && statuses.iter().all(|s| *s == Status::NoAction) => {
            Status::NoAction
        }
        None => Status::Ok,
    }
}

/// `'<id>': <message> (<status>)`
pub fn format_step_message(id: &str, response: &Response) -> String {
    format!(
        "'{}': {} ({})",
        id,
        response.message().unwrap_or("No message"),
        response.status
    )
}

/// Join messages with `, ` or as a bulleted list starting on a new line
pub fn join_messages(messages: &[String], bulleted: bool) -> String {
    if bulleted {
        messages.iter().map(|m| format!("\n- {}", m)).collect()
    } else {
        messages.join(", ")
    }
}

/// Set `origin` only where no origin exists yet
pub fn with_default_origin(mut response: Response, origin: &str) -> Response {
    if response.origin.is_none() {
        response.origin = Some(origin.to_string());
    }
    response
}

/// Prefix the origin with `job:<job_id>:step:`. An existing origin is kept
/// after the prefix, otherwise the step id is used.
pub fn prefix_origin(mut response: Response, job_id: &str, step_id: &str) -> Response {
    let inner = response.origin.take().unwrap_or_else(|| step_id.to_string());
    response.origin = Some(format!("job:{}:step:{}", job_id, inner));
    response
}

/// Combine the responses of sibling steps. Failures go to `error`,
/// `noaction` messages go to `warning`, and both are kept under `responses`
/// with the sibling id as their origin.
pub fn combine_responses(entries: &[(String, Response)]) -> Response {
    let status = unify_status(entries.iter().map(|(_, response)| &response.status));
    let mut response = Response::new(status);

    let errors: Vec<String> = entries
        .iter()
        .filter(|(_, r)| r.is_failure())
        .map(|(id, r)| format_step_message(id, r))
        .collect();
    let warnings: Vec<String> = entries
        .iter()
        .filter(|(_, r)| r.status == Status::NoAction)
        .map(|(id, r)| format_step_message(id, r))
        .collect();

    if !errors.is_empty() {
        response.error = Some(join_messages(&errors, false));
    }
    if !warnings.is_empty() {
        response.warning = Some(join_messages(&warnings, false));
    }

    let contributing: Vec<Response> = entries
        .iter()
        .filter(|(_, r)| !r.is_success())
        .map(|(id, r)| with_default_origin(r.clone(), id))
        .collect();
    if !contributing.is_empty() {
        response.responses = Some(contributing);
    }

    response
}

/// Combine the responses of iterated sub-actions: data is flattened into one
/// array, status is `ok` only when every item succeeded.
pub fn combine_iterated(entries: &[(String, Response)]) -> Response {
    let data: Vec<Value> = entries
        .iter()
        .filter_map(|(_, response)| response.data.clone())
        .flat_map(|data| match data {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        })
        .collect();

    let failed: Vec<&(String, Response)> =
        entries.iter().filter(|(_, r)| !r.is_success()).collect();

    if failed.is_empty() {
        return Response::ok().with_data(Value::Array(data));
    }

    let message = failed
        .iter()
        .map(|(_, r)| format!("[{}] {}", r.status, r.message().unwrap_or("No message")))
        .collect::<Vec<_>>()
        .join(" | ");

    Response::error(message)
        .with_data(Value::Array(data))
        .with_responses(
            failed
                .into_iter()
                .map(|(id, r)| with_default_origin(r.clone(), id))
                .collect(),
        )
}
