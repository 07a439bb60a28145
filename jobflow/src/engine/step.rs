// Step execution
//
// A step either dispatches one action, optionally iterated over items, or
// runs a group of child steps in parallel. Failures never escape a step:
// dispatch errors, mutation errors and failed conditions all end up as the
// response stored under the step id.

use super::aggregate::{combine_iterated, combine_responses, with_default_origin};
use super::conditions::{ConditionKind, Conditions};
use super::context::{context_to_value, extend_context, group_id, ContextMap};
use super::mutation::{resolve, Mutator};
use crate::dispatch::Dispatcher;
use crate::errors::JobError;
use crate::models::{Action, ConditionsDefinition, Meta, Response, Status, StepDefinition};
use crate::pipeline::{Evaluator, Pipeline};
use crate::telemetry;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

/// Result of running a step: every executed action keyed by id, and
/// whether the job should stop after this step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub results: ContextMap,
    pub should_break: bool,
}

impl StepOutcome {
    fn single(id: &str, action: Action, should_break: bool) -> Self {
        let mut results = ContextMap::new();
        results.insert(id.to_string(), action);
        Self {
            results,
            should_break,
        }
    }

    pub fn response(&self, id: &str) -> Option<&Response> {
        self.results.get(id).and_then(|action| action.response.as_ref())
    }
}

/// Settings shared by every step of one job while compiling
#[derive(Clone, Copy)]
pub struct StepOptions<'a> {
    pub evaluator: &'a dyn Evaluator,
    pub job_id: &'a str,
    pub fail_on_error_in_postconditions: bool,
    pub default_iterate_concurrency: usize,
}

#[derive(Debug)]
struct ActionStep {
    action: Action,
    preconditions: Option<Conditions>,
    postconditions: Option<Conditions>,
    premutation: Option<Mutator>,
    postmutation: Option<Mutator>,
    iterate: Option<Pipeline>,
    iterate_concurrency: usize,
    fail_on_error_in_postconditions: bool,
    previous_step_id: Option<String>,
    /// The only step of an action job. Its actions get no `stepId`.
    is_job_action: bool,
}

#[derive(Debug)]
enum StepKind {
    Action(Box<ActionStep>),
    Parallel(Vec<Step>),
}

/// A compiled step
#[derive(Debug)]
pub struct Step {
    id: String,
    job_id: String,
    kind: StepKind,
}

impl Step {
    /// Compile a single-action step. `previous_step_id` is the flow entry run
    /// before this one, used by the implicit postcondition.
    pub fn compile(
        definition: &StepDefinition,
        options: &StepOptions<'_>,
        previous_step_id: Option<&str>,
    ) -> Result<Self, JobError> {
        let id = definition.id.as_str();
        if id.is_empty() {
            return Err(JobError::InvalidDefinition(format!(
                "A step in job '{}' is missing an id",
                options.job_id
            )));
        }
        let action = definition
            .action
            .clone()
            .ok_or_else(|| JobError::InvalidDefinition(format!("Step '{}' has no action", id)))?;

        let preconditions =
            compile_conditions(definition.preconditions.as_ref(), ConditionKind::Pre, id, options)?;
        let postconditions = compile_conditions(
            definition.postconditions.as_ref(),
            ConditionKind::Post,
            id,
            options,
        )?;

        let premutation = resolve(
            definition.premutation.as_ref(),
            definition.mutation.as_ref(),
            id,
            ("mutation", "premutation"),
        )?
        .map(|def| Mutator::compile(&def, options.evaluator, &location(id, "premutation")))
        .transpose()?;
        let postmutation = resolve(
            definition.postmutation.as_ref(),
            definition.response_mutation.as_ref(),
            id,
            ("responseMutation", "postmutation"),
        )?
        .map(|def| Mutator::compile(&def, options.evaluator, &location(id, "postmutation")))
        .transpose()?;

        let iterate = match (&definition.iterate, &definition.iterate_path) {
            (Some(_), Some(_)) => {
                return Err(JobError::ConflictingFields {
                    step_id: id.to_string(),
                    legacy: "iteratePath",
                    modern: "iterate",
                })
            }
            (Some(pipeline), None) => Some(pipeline.clone()),
            (None, Some(path)) => Some(Value::String(path.clone())),
            (None, None) => None,
        };
        let iterate = iterate
            .map(|def| {
                options
                    .evaluator
                    .compile(&def)
                    .map_err(|e| JobError::pipeline(location(id, "iterate"), e))
            })
            .transpose()?;

        let iterate_concurrency = definition
            .iterate_concurrency
            .unwrap_or(options.default_iterate_concurrency)
            .max(1);

        Ok(Self {
            id: id.to_string(),
            job_id: options.job_id.to_string(),
            kind: StepKind::Action(Box::new(ActionStep {
                action,
                preconditions,
                postconditions,
                premutation,
                postmutation,
                iterate,
                iterate_concurrency,
                fail_on_error_in_postconditions: options.fail_on_error_in_postconditions,
                previous_step_id: previous_step_id.map(str::to_string),
                is_job_action: false,
            })),
        })
    }

    /// Group steps to run in parallel. The group id is the child ids joined
    /// with `:`.
    pub fn parallel(children: Vec<Step>) -> Result<Self, JobError> {
        let Some(first) = children.first() else {
            return Err(JobError::InvalidDefinition(
                "A parallel step group must have at least one step".to_string(),
            ));
        };
        let job_id = first.job_id.clone();
        let id = group_id(children.iter().map(|step| step.id.as_str()));

        Ok(Self {
            id,
            job_id,
            kind: StepKind::Parallel(children),
        })
    }

    /// Mark this step as the single action of an action job
    pub(crate) fn into_job_action(mut self) -> Self {
        if let StepKind::Action(step) = &mut self.kind {
            step.is_job_action = true;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, StepKind::Parallel(_))
    }

    /// Run the step against `context`. Never fails; the outcome carries the
    /// step's response under its id.
    pub fn run<'a>(
        &'a self,
        meta: &'a Meta,
        context: &'a ContextMap,
        dispatcher: &'a dyn Dispatcher,
    ) -> BoxFuture<'a, StepOutcome> {
        let span = info_span!("step", job_id = %self.job_id, step_id = %self.id);

        async move {
            let outcome = match &self.kind {
                StepKind::Action(step) => self.run_action(step, meta, context, dispatcher).await,
                StepKind::Parallel(children) => {
                    self.run_parallel(children, meta, context, dispatcher).await
                }
            };

            if let Some(response) = outcome.response(&self.id) {
                telemetry::record_step_run(response.status);
                debug!(
                    status = %response.status,
                    should_break = outcome.should_break,
                    "Step finished"
                );
            }
            outcome
        }
        .instrument(span)
        .boxed()
    }

    async fn run_parallel(
        &self,
        children: &[Step],
        meta: &Meta,
        context: &ContextMap,
        dispatcher: &dyn Dispatcher,
    ) -> StepOutcome {
        let outcomes = join_all(
            children
                .iter()
                .map(|child| child.run(meta, context, dispatcher)),
        )
        .await;

        let mut results = ContextMap::new();
        let mut entries = Vec::with_capacity(children.len());
        let mut should_break = false;

        for (child, outcome) in children.iter().zip(outcomes) {
            should_break |= outcome.should_break;
            if let Some(response) = outcome.response(&child.id) {
                entries.push((child.id.clone(), response.clone()));
            }
            results.extend(outcome.results);
        }

        let response = combine_responses(&entries);
        results.insert(self.id.clone(), Action::default().with_response(response));

        StepOutcome {
            results,
            should_break,
        }
    }

    async fn run_action(
        &self,
        step: &ActionStep,
        meta: &Meta,
        context: &ContextMap,
        dispatcher: &dyn Dispatcher,
    ) -> StepOutcome {
        let mut template = step.action.clone();
        template.meta = self.action_meta(&step.action.meta, meta, step.is_job_action);

        if let Some(preconditions) = &step.preconditions {
            let outcome = preconditions.validate(&context_to_value(context, Some(&template)));
            if let Some(response) = outcome.response {
                debug!(
                    status = %response.status,
                    should_break = outcome.should_break,
                    "Preconditions failed"
                );
                return StepOutcome::single(
                    &self.id,
                    Action::default().with_response(response),
                    outcome.should_break,
                );
            }
        }

        let (mut action, item_results) = match &step.iterate {
            Some(iterate) => {
                self.dispatch_iterated(step, iterate, template, context, dispatcher)
                    .await
            }
            None => (
                self.dispatch_one(step, template, context, dispatcher).await,
                ContextMap::new(),
            ),
        };

        let scope = extend_context(context, &item_results);

        if let Some(postmutation) = &step.postmutation {
            action = match postmutation.mutate(&action, &scope) {
                Ok(mutated) => mutated,
                Err(e) => {
                    warn!(error = %e, "Postmutation failed");
                    action.with_response(Response::error(format!("Postmutation failed: {}", e)))
                }
            };
        }

        let (action, should_break) = self.check_postconditions(step, action, &scope);

        let mut results = item_results;
        results.insert(self.id.clone(), action);
        StepOutcome {
            results,
            should_break,
        }
    }

    /// Meta for dispatched actions: the job's sub-meta with the template's
    /// queue flags. Ids and queue timestamps are never carried over.
    fn action_meta(&self, template: &Meta, meta: &Meta, is_job_action: bool) -> Meta {
        Meta {
            id: None,
            ident: meta.ident.clone().or_else(|| template.ident.clone()),
            cid: meta.cid.clone().or_else(|| template.cid.clone()),
            gid: meta.gid.clone(),
            job_id: Some(self.job_id.clone()),
            step_id: (!is_job_action).then(|| self.id.clone()),
            project: meta.project.clone().or_else(|| template.project.clone()),
            queue: template.queue.clone(),
            queued_at: None,
            extra: template.extra.clone(),
        }
    }

    async fn dispatch_iterated(
        &self,
        step: &ActionStep,
        iterate: &Pipeline,
        template: Action,
        context: &ContextMap,
        dispatcher: &dyn Dispatcher,
    ) -> (Action, ContextMap) {
        let items = match iterate.evaluate(&context_to_value(context, Some(&template))) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Null) => Vec::new(),
            Ok(item) => vec![item],
            Err(e) => {
                warn!(error = %e, "Could not resolve items to iterate over");
                let response =
                    Response::error(format!("Could not resolve items to iterate over: {}", e));
                return (template.with_response(response), ContextMap::new());
            }
        };

        if items.is_empty() {
            let action = self.dispatch_one(step, template, context, dispatcher).await;
            return (action, ContextMap::new());
        }

        debug!(
            items = items.len(),
            concurrency = step.iterate_concurrency,
            "Iterating action"
        );

        let semaphore = Semaphore::new(step.iterate_concurrency);
        let dispatched = join_all(items.into_iter().map(|item| {
            let action = template.clone().with_payload("data", item);
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.dispatch_one(step, action, context, dispatcher).await
            }
        }))
        .await;

        let results: ContextMap = dispatched
            .into_iter()
            .enumerate()
            .map(|(index, action)| (format!("{}_{}", self.id, index), action))
            .collect();

        let entries: Vec<(String, Response)> = results
            .iter()
            .map(|(id, action)| {
                let response = action
                    .response
                    .clone()
                    .unwrap_or_else(|| Response::error("No response"));
                (id.clone(), response)
            })
            .collect();

        (template.with_response(combine_iterated(&entries)), results)
    }

    /// Apply the premutation and dispatch. The returned action carries the
    /// response.
    async fn dispatch_one(
        &self,
        step: &ActionStep,
        action: Action,
        context: &ContextMap,
        dispatcher: &dyn Dispatcher,
    ) -> Action {
        let action = match &step.premutation {
            Some(premutation) => match premutation.mutate(&action, context) {
                Ok(mutated) => mutated,
                Err(e) => {
                    warn!(error = %e, "Premutation failed");
                    return action
                        .with_response(Response::error(format!("Premutation failed: {}", e)));
                }
            },
            None => action,
        };

        let response = dispatch(dispatcher, action.clone()).await;
        action.with_response(response)
    }

    fn check_postconditions(
        &self,
        step: &ActionStep,
        mut action: Action,
        scope: &ContextMap,
    ) -> (Action, bool) {
        if let Some(postconditions) = &step.postconditions {
            let mut own_scope = scope.clone();
            own_scope.insert(self.id.clone(), action.clone());
            let outcome = postconditions.validate(&context_to_value(&own_scope, Some(&action)));

            return match outcome.response {
                Some(response) => {
                    debug!(status = %response.status, "Postconditions failed");
                    (action.with_response(response), outcome.should_break)
                }
                None => {
                    action.response = Some(accept(action.response.take()));
                    (action, false)
                }
            };
        }

        if step.fail_on_error_in_postconditions {
            let failed = action.response.as_ref().is_some_and(Response::is_failure);
            return (action, failed);
        }

        let previous = step.previous_step_id.as_deref().and_then(|id| {
            scope
                .get(id)
                .and_then(|previous| previous.response.as_ref())
                .map(|response| (id, response))
        });
        match previous {
            Some((previous_id, previous)) if previous.is_failure() => {
                let mut response = Response::new(previous.status)
                    .with_responses(vec![with_default_origin(previous.clone(), previous_id)]);
                response.error = previous.message().map(str::to_string);
                (action.with_response(response), true)
            }
            _ => (action, false),
        }
    }
}

fn compile_conditions(
    definition: Option<&ConditionsDefinition>,
    kind: ConditionKind,
    id: &str,
    options: &StepOptions<'_>,
) -> Result<Option<Conditions>, JobError> {
    let field = match kind {
        ConditionKind::Pre => "preconditions",
        ConditionKind::Post => "postconditions",
    };
    definition
        .map(|def| Conditions::compile(def, kind, options.evaluator, &location(id, field)))
        .transpose()
}

fn location(id: &str, field: &str) -> String {
    format!("step '{}' {}", id, field)
}

/// Accepted by postconditions: the response becomes `ok`, keeping warning
/// and data.
fn accept(response: Option<Response>) -> Response {
    let mut response = response.unwrap_or_else(Response::ok);
    response.status = Status::Ok;
    response.error = None;
    response
}

async fn dispatch(dispatcher: &dyn Dispatcher, action: Action) -> Response {
    match dispatcher.dispatch(action).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Dispatch failed");
            telemetry::record_dispatch_error();
            Response::error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::ACTION_KEY;
    use crate::errors::EvaluationError;
    use crate::pipeline::PathEvaluator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Responder = Box<dyn Fn(&Action) -> anyhow::Result<Response> + Send + Sync>;

    struct MockDispatcher {
        calls: Mutex<Vec<Action>>,
        responder: Responder,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockDispatcher {
        fn new<F>(responder: F) -> Self
        where
            F: Fn(&Action) -> anyhow::Result<Response> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn ok() -> Self {
            Self::new(|_| Ok(Response::ok()))
        }

        fn calls(&self) -> Vec<Action> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for MockDispatcher {
        async fn dispatch(&self, action: Action) -> anyhow::Result<Response> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.lock().unwrap().push(action.clone());
            let response = (self.responder)(&action);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            response
        }
    }

    /// Compiles every definition to a pipeline that fails when run
    struct UnresolvableEvaluator;

    impl Evaluator for UnresolvableEvaluator {
        fn compile(&self, _definition: &Value) -> Result<Pipeline, EvaluationError> {
            Ok(Pipeline::new(|_| {
                Err(EvaluationError::EvaluationFailed("No items here".to_string()))
            }))
        }
    }

    fn options(evaluator: &PathEvaluator) -> StepOptions<'_> {
        StepOptions {
            evaluator,
            job_id: "job1",
            fail_on_error_in_postconditions: false,
            default_iterate_concurrency: 1,
        }
    }

    fn step(definition: Value, previous: Option<&str>) -> Step {
        let evaluator = PathEvaluator::new();
        let definition: StepDefinition = serde_json::from_value(definition).unwrap();
        Step::compile(&definition, &options(&evaluator), previous).unwrap()
    }

    fn context_with(action: Action) -> ContextMap {
        let mut context = ContextMap::new();
        context.insert(ACTION_KEY.to_string(), action);
        context
    }

    fn sub_meta() -> Meta {
        Meta {
            job_id: Some("job1".to_string()),
            gid: Some("run1".to_string()),
            cid: Some("corr1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dispatches_action_with_meta() {
        let step = step(
            json!({ "id": "setEntry", "action": { "type": "SET", "meta": { "queue": true, "id": "ignored" } } }),
            None,
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step
            .run(&sub_meta(), &context_with(Action::new("RUN")), &dispatcher)
            .await;

        assert!(!outcome.should_break);
        assert_eq!(outcome.response("setEntry").unwrap().status, Status::Ok);
        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 1);
        let meta = &calls[0].meta;
        assert_eq!(meta.job_id.as_deref(), Some("job1"));
        assert_eq!(meta.step_id.as_deref(), Some("setEntry"));
        assert_eq!(meta.gid.as_deref(), Some("run1"));
        assert_eq!(meta.cid.as_deref(), Some("corr1"));
        assert_eq!(meta.queue, Some(json!(true)));
        assert_eq!(meta.id, None);
    }

    #[tokio::test]
    async fn test_job_action_has_no_step_id() {
        let step = step(json!({ "id": "job1", "action": { "type": "SET" } }), None).into_job_action();
        let dispatcher = MockDispatcher::ok();

        step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert_eq!(dispatcher.calls()[0].meta.step_id, None);
    }

    #[tokio::test]
    async fn test_failing_precondition_skips_dispatch() {
        let step = step(
            json!({
                "id": "setEntry",
                "action": { "type": "SET" },
                "preconditions": [{
                    "condition": "^^action.payload.id",
                    "failResponse": { "status": "badrequest", "error": "Must have an id" },
                    "break": true
                }]
            }),
            None,
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step
            .run(&sub_meta(), &context_with(Action::new("RUN")), &dispatcher)
            .await;

        assert!(outcome.should_break);
        assert_eq!(outcome.results.len(), 1);
        let response = outcome.response("setEntry").unwrap();
        assert_eq!(response.status, Status::BadRequest);
        assert_eq!(response.error.as_deref(), Some("Must have an id"));
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_error_becomes_error_response() {
        let step = step(json!({ "id": "setEntry", "action": { "type": "SET" } }), None);
        let dispatcher = MockDispatcher::new(|_| Err(anyhow::anyhow!("Connection refused")));

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        let response = outcome.response("setEntry").unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error.as_deref(), Some("Connection refused"));
    }

    #[tokio::test]
    async fn test_iterate_over_items() {
        let step = step(
            json!({
                "id": "setEntries",
                "action": { "type": "SET" },
                "iterate": { "$value": [{ "id": "a" }, { "id": "b" }] }
            }),
            None,
        );
        let dispatcher = MockDispatcher::new(|_| Ok(Response::ok().with_data(json!([]))));

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        let response = outcome.response("setEntries").unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.data, Some(json!([])));
        assert!(outcome.results.contains_key("setEntries_0"));
        assert!(outcome.results.contains_key("setEntries_1"));
        assert_eq!(
            outcome.results["setEntries_1"].payload.get("data"),
            Some(&json!({ "id": "b" }))
        );
        assert_eq!(dispatcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_iterate_path_reads_earlier_step() {
        let step = step(
            json!({
                "id": "setEntries",
                "action": { "type": "SET" },
                "iteratePath": "^^getEntries.response.data",
                "iterateConcurrency": 3
            }),
            None,
        );
        let mut context = ContextMap::new();
        context.insert(
            "getEntries".to_string(),
            Action::new("GET").with_response(Response::ok().with_data(json!([1, 2, 3, 4, 5, 6]))),
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step.run(&sub_meta(), &context, &dispatcher).await;

        assert_eq!(dispatcher.calls().len(), 6);
        assert_eq!(outcome.results.len(), 7);
        assert!(dispatcher.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_iteration_is_serial_by_default() {
        let step = step(
            json!({
                "id": "setEntries",
                "action": { "type": "SET" },
                "iterate": { "$value": [1, 2, 3] }
            }),
            None,
        );
        let dispatcher = MockDispatcher::ok();

        step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert_eq!(dispatcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_items_are_combined() {
        let step = step(
            json!({
                "id": "setEntries",
                "action": { "type": "SET" },
                "iterate": { "$value": ["a", "b"] }
            }),
            None,
        );
        let dispatcher = MockDispatcher::new(|action| {
            if action.payload.get("data") == Some(&json!("b")) {
                Ok(Response::with_message(Status::Timeout, "Too slow"))
            } else {
                Ok(Response::ok())
            }
        });

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        let response = outcome.response("setEntries").unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error.as_deref(), Some("[timeout] Too slow"));
        let responses = response.responses.as_ref().unwrap();
        assert_eq!(responses[0].origin.as_deref(), Some("setEntries_1"));
    }

    #[tokio::test]
    async fn test_premutation_and_postmutation() {
        let step = step(
            json!({
                "id": "getEntry",
                "action": { "type": "GET", "payload": { "type": "entry" } },
                "premutation": { ".": ".", "payload.id": "^^action.payload.id" },
                "postmutation": { ".": ".", "response.data": "response.data.0" }
            }),
            None,
        );
        let dispatcher =
            MockDispatcher::new(|_| Ok(Response::ok().with_data(json!([{ "id": "ent1" }]))));
        let context = context_with(Action::new("RUN").with_payload("id", json!("ent1")));

        let outcome = step.run(&sub_meta(), &context, &dispatcher).await;

        let calls = dispatcher.calls();
        assert_eq!(calls[0].payload.get("id"), Some(&json!("ent1")));
        assert_eq!(calls[0].payload.get("type"), Some(&json!("entry")));
        let response = outcome.response("getEntry").unwrap();
        assert_eq!(response.data, Some(json!({ "id": "ent1" })));
    }

    #[tokio::test]
    async fn test_failing_premutation_skips_dispatch() {
        let step = step(
            json!({
                "id": "setEntry",
                "action": { "type": "SET" },
                "premutation": { "$value": "not an action" }
            }),
            None,
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert!(dispatcher.calls().is_empty());
        let response = outcome.response("setEntry").unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(response
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Premutation failed:")));
    }

    #[tokio::test]
    async fn test_failing_postmutation_is_an_error() {
        let step = step(
            json!({
                "id": "setEntry",
                "action": { "type": "SET" },
                "postmutation": { "$value": "not an action" }
            }),
            None,
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert_eq!(dispatcher.calls().len(), 1);
        let response = outcome.response("setEntry").unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(response
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Postmutation failed:")));
    }

    #[tokio::test]
    async fn test_unresolvable_iterate_skips_dispatch() {
        let evaluator = UnresolvableEvaluator;
        let definition: StepDefinition = serde_json::from_value(json!({
            "id": "setEntries",
            "action": { "type": "SET" },
            "iterate": "unresolvable"
        }))
        .unwrap();
        let options = StepOptions {
            evaluator: &evaluator,
            job_id: "job1",
            fail_on_error_in_postconditions: false,
            default_iterate_concurrency: 1,
        };
        let step = Step::compile(&definition, &options, None).unwrap();
        let dispatcher = MockDispatcher::ok();

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert!(dispatcher.calls().is_empty());
        assert_eq!(outcome.results.len(), 1);
        let response = outcome.response("setEntries").unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(
            response.error.as_deref(),
            Some("Could not resolve items to iterate over: Pipeline evaluation failed: No items here")
        );
    }

    #[tokio::test]
    async fn test_legacy_mutations_merge_onto_action() {
        let step = step(
            json!({
                "id": "getEntry",
                "action": { "type": "GET", "payload": { "type": "entry" } },
                "mutation": { "payload.id": "^^action.payload.id" },
                "responseMutation": { "response.warning": { "$value": "Checked" } }
            }),
            None,
        );
        let dispatcher =
            MockDispatcher::new(|_| Ok(Response::ok().with_data(json!([{ "id": "ent1" }]))));
        let context = context_with(Action::new("RUN").with_payload("id", json!("ent1")));

        let outcome = step.run(&sub_meta(), &context, &dispatcher).await;

        let calls = dispatcher.calls();
        assert_eq!(calls[0].action_type, "GET");
        assert_eq!(calls[0].payload.get("type"), Some(&json!("entry")));
        assert_eq!(calls[0].payload.get("id"), Some(&json!("ent1")));
        let response = outcome.response("getEntry").unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.data, Some(json!([{ "id": "ent1" }])));
        assert_eq!(response.warning.as_deref(), Some("Checked"));
    }

    #[tokio::test]
    async fn test_modern_mutation_replaces_action() {
        let step = step(
            json!({
                "id": "getEntry",
                "action": { "type": "GET", "payload": { "type": "entry" } },
                "premutation": { "type": "GET", "payload.id": "^^action.payload.id" }
            }),
            None,
        );
        let dispatcher = MockDispatcher::ok();
        let context = context_with(Action::new("RUN").with_payload("id", json!("ent1")));

        step.run(&sub_meta(), &context, &dispatcher).await;

        let calls = dispatcher.calls();
        assert_eq!(calls[0].payload.get("id"), Some(&json!("ent1")));
        assert_eq!(calls[0].payload.get("type"), None);
    }

    #[tokio::test]
    async fn test_schema_postconditions() {
        let step = step(
            json!({
                "id": "getEntries",
                "action": { "type": "GET" },
                "postconditions": { "$action.response.data": { "type": "array", "minItems": 1 } }
            }),
            None,
        );

        let empty = MockDispatcher::new(|_| Ok(Response::ok().with_data(json!([]))));
        let outcome = step.run(&sub_meta(), &ContextMap::new(), &empty).await;
        let response = outcome.response("getEntries").unwrap();
        assert_eq!(response.status, Status::NoAction);
        assert!(response
            .warning
            .as_deref()
            .is_some_and(|w| w.starts_with("'$action.response.data' did not pass")));
        assert!(!outcome.should_break);

        let filled = MockDispatcher::new(|_| {
            Ok(Response::with_message(Status::NotFound, "Partial").with_data(json!([1])))
        });
        let outcome = step.run(&sub_meta(), &ContextMap::new(), &filled).await;
        let response = outcome.response("getEntries").unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.error, None);
    }

    #[tokio::test]
    async fn test_passing_postconditions_accept_response() {
        let step = step(
            json!({
                "id": "getEntry",
                "action": { "type": "GET" },
                "postconditions": [{ "condition": { "$eq": ["$action.response.status", "notfound"] } }]
            }),
            None,
        );
        let dispatcher =
            MockDispatcher::new(|_| Ok(Response::with_message(Status::NotFound, "No entry")));

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        let response = outcome.response("getEntry").unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.error, None);
        assert!(!outcome.should_break);
    }

    #[tokio::test]
    async fn test_failing_postconditions_override_response() {
        let step = step(
            json!({
                "id": "getEntry",
                "action": { "type": "GET" },
                "postconditions": [{
                    "condition": "getEntry.response.data",
                    "failResponse": "No data",
                    "break": true
                }]
            }),
            None,
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        let response = outcome.response("getEntry").unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error.as_deref(), Some("No data"));
        assert!(outcome.should_break);
    }

    #[tokio::test]
    async fn test_implicit_postcondition_checks_previous_step() {
        let step = step(json!({ "id": "setEntry", "action": { "type": "SET" } }), Some("getEntry"));
        let mut context = ContextMap::new();
        context.insert(
            "getEntry".to_string(),
            Action::new("GET").with_response(Response::with_message(Status::Timeout, "Too slow")),
        );
        let dispatcher = MockDispatcher::ok();

        let outcome = step.run(&sub_meta(), &context, &dispatcher).await;

        assert!(outcome.should_break);
        let response = outcome.response("setEntry").unwrap();
        assert_eq!(response.status, Status::Timeout);
        assert_eq!(response.error.as_deref(), Some("Too slow"));
        let responses = response.responses.as_ref().unwrap();
        assert_eq!(responses[0].origin.as_deref(), Some("getEntry"));
    }

    #[tokio::test]
    async fn test_fail_on_error_in_postconditions_checks_own_response() {
        let evaluator = PathEvaluator::new();
        let definition = StepDefinition::new("setEntry", Action::new("SET"));
        let options = StepOptions {
            fail_on_error_in_postconditions: true,
            ..options(&evaluator)
        };
        let step = Step::compile(&definition, &options, None).unwrap();
        let dispatcher =
            MockDispatcher::new(|_| Ok(Response::with_message(Status::BadRequest, "Bad")));

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert!(outcome.should_break);
        assert_eq!(outcome.response("setEntry").unwrap().status, Status::BadRequest);
    }

    #[tokio::test]
    async fn test_noaction_does_not_break() {
        let evaluator = PathEvaluator::new();
        let definition = StepDefinition::new("setEntry", Action::new("SET"));
        let options = StepOptions {
            fail_on_error_in_postconditions: true,
            ..options(&evaluator)
        };
        let step = Step::compile(&definition, &options, None).unwrap();
        let dispatcher = MockDispatcher::new(|_| Ok(Response::noaction("Nothing to set")));

        let outcome = step.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert!(!outcome.should_break);
    }

    #[tokio::test]
    async fn test_parallel_group_runs_every_child() {
        let evaluator = PathEvaluator::new();
        let options = options(&evaluator);
        let children = vec![
            Step::compile(&StepDefinition::new("setA", Action::new("SET_A")), &options, None)
                .unwrap(),
            Step::compile(&StepDefinition::new("setB", Action::new("SET_B")), &options, None)
                .unwrap(),
        ];
        let group = Step::parallel(children).unwrap();
        assert_eq!(group.id(), "setA:setB");
        assert!(group.is_parallel());

        let dispatcher = MockDispatcher::new(|action| {
            if action.action_type == "SET_A" {
                Ok(Response::with_message(Status::Timeout, "Too slow"))
            } else {
                Ok(Response::ok())
            }
        });

        let outcome = group.run(&sub_meta(), &ContextMap::new(), &dispatcher).await;

        assert_eq!(dispatcher.calls().len(), 2);
        assert!(!outcome.should_break);
        assert!(outcome.results.contains_key("setA"));
        assert!(outcome.results.contains_key("setB"));
        let response = outcome.response("setA:setB").unwrap();
        assert_eq!(response.status, Status::Timeout);
        assert_eq!(response.error.as_deref(), Some("'setA': Too slow (timeout)"));
    }

    #[test]
    fn test_empty_parallel_group_is_rejected() {
        assert!(matches!(
            Step::parallel(Vec::new()),
            Err(JobError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_step_without_action_is_rejected() {
        let evaluator = PathEvaluator::new();
        let definition = StepDefinition {
            id: "setEntry".to_string(),
            ..Default::default()
        };
        let result = Step::compile(&definition, &options(&evaluator), None);
        assert!(matches!(result, Err(JobError::InvalidDefinition(_))));
    }

    #[test]
    fn test_both_iterate_fields_are_rejected() {
        let evaluator = PathEvaluator::new();
        let definition = StepDefinition {
            iterate: Some(json!("items")),
            iterate_path: Some("items".to_string()),
            ..StepDefinition::new("setEntries", Action::new("SET"))
        };
        let result = Step::compile(&definition, &options(&evaluator), None);
        assert!(matches!(result, Err(JobError::ConflictingFields { .. })));
    }
}
