// Job: a compiled flow of steps run in sequence

use super::aggregate::{format_step_message, join_messages, prefix_origin};
use super::context::{is_reserved_step_id, ContextMap, ACTION_KEY};
use super::mutation::{resolve, Mutator};
use super::step::{Step, StepOptions};
use super::EngineOptions;
use crate::dispatch::Dispatcher;
use crate::errors::{JobError, ScheduleError};
use crate::models::{Action, FlowEntry, JobDefinition, Meta, Response, StepDefinition};
use crate::pipeline::Evaluator;
use crate::schedule::Schedule;
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A job compiled from its definition. Compiled once, run many times; no
/// state is kept between runs.
#[derive(Debug)]
pub struct Job {
    id: String,
    steps: Vec<Step>,
    is_flow: bool,
    postmutation: Option<Mutator>,
    schedule: Option<Schedule>,
}

impl Job {
    /// Compile a job with default engine options
    pub fn new(definition: &JobDefinition, evaluator: &dyn Evaluator) -> Result<Self, JobError> {
        Self::with_options(definition, evaluator, &EngineOptions::default())
    }

    /// Compile a job. Every pipeline and the schedule are compiled here, so
    /// a definition error surfaces before the first run.
    pub fn with_options(
        definition: &JobDefinition,
        evaluator: &dyn Evaluator,
        options: &EngineOptions,
    ) -> Result<Self, JobError> {
        let id = definition
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let flow = definition.flow.as_deref().unwrap_or(&[]);

        if definition.action.is_some() && !flow.is_empty() {
            return Err(JobError::InvalidDefinition(format!(
                "Job '{}' has both an action and a flow",
                id
            )));
        }

        let step_options = StepOptions {
            evaluator,
            job_id: &id,
            fail_on_error_in_postconditions: definition
                .fail_on_error_in_postconditions
                .unwrap_or(options.fail_on_error_in_postconditions),
            default_iterate_concurrency: options.default_iterate_concurrency,
        };

        let (steps, postmutation) = match &definition.action {
            Some(action) => {
                // The only step takes the job id, so it lives in the same context
                check_step_id(&id, &mut HashSet::new())?;
                // The job's postmutation belongs to its only step
                let step = StepDefinition {
                    postmutation: definition.postmutation.clone(),
                    response_mutation: definition.response_mutation.clone(),
                    ..StepDefinition::new(id.clone(), action.clone())
                };
                let step = Step::compile(&step, &step_options, None)?.into_job_action();
                (vec![step], None)
            }
            None => {
                let steps = compile_flow(flow, &step_options)?;
                let postmutation = resolve(
                    definition.postmutation.as_ref(),
                    definition.response_mutation.as_ref(),
                    &id,
                    ("responseMutation", "postmutation"),
                )?
                .map(|def| {
                    Mutator::compile(&def, evaluator, &format!("job '{}' postmutation", id))
                })
                .transpose()?;
                (steps, postmutation)
            }
        };

        let schedule = definition
            .cron
            .as_deref()
            .map(|cron| {
                let tz = definition
                    .tz
                    .as_deref()
                    .or(options.default_timezone.as_deref());
                Schedule::new(Some(cron), tz)
            })
            .transpose()?;

        debug!(job_id = %id, steps = steps.len(), "Job compiled");

        Ok(Self {
            is_flow: definition.action.is_none(),
            id,
            steps,
            postmutation,
            schedule,
        })
    }

    /// Parse and compile a job from JSON
    pub fn from_json(json: &str, evaluator: &dyn Evaluator) -> Result<Self, JobError> {
        let definition = JobDefinition::from_json(json)?;
        Self::new(&definition, evaluator)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_flow(&self) -> bool {
        self.is_flow
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// True if the job's schedule fires in `(start, end]`. Jobs without a
    /// cron expression never do.
    pub fn should_run(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        match &self.schedule {
            Some(schedule) => schedule.should_run(start, end),
            None => Ok(false),
        }
    }

    /// Run the job for `action`. Always resolves to a response.
    ///
    /// `set_progress` gets `(i + 1) / (n + 1)` after step `i` of `n`, and `1.0`
    /// when the run is done. `group_id` becomes the `gid` of every dispatched
    /// action, falling back to the triggering action's id.
    #[instrument(skip_all, fields(job_id = %self.id, action_type = %action.action_type))]
    pub async fn run(
        &self,
        action: Action,
        dispatcher: &dyn Dispatcher,
        set_progress: &(dyn Fn(f64) + Send + Sync),
        group_id: Option<&str>,
    ) -> Response {
        let started = Instant::now();
        let response = self
            .run_steps(action, dispatcher, set_progress, group_id)
            .await;
        set_progress(1.0);

        telemetry::record_job_run(&self.id, response.status, started.elapsed());
        info!(
            status = %response.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
        response
    }

    async fn run_steps(
        &self,
        action: Action,
        dispatcher: &dyn Dispatcher,
        set_progress: &(dyn Fn(f64) + Send + Sync),
        group_id: Option<&str>,
    ) -> Response {
        if self.steps.is_empty() {
            return Response::noaction(format!("Job '{}' has no action or flow", self.id))
                .with_origin(self.origin());
        }

        let meta = self.sub_meta(&action.meta, group_id);
        let mut context = ContextMap::new();
        context.insert(ACTION_KEY.to_string(), action);

        let step_count = self.steps.len();
        let mut executed = Vec::with_capacity(step_count);

        for (index, step) in self.steps.iter().enumerate() {
            let outcome = step.run(&meta, &context, dispatcher).await;
            let should_break = outcome.should_break;
            let response = outcome.response(step.id()).cloned();

            context.extend(outcome.results);
            if let (Some(response), Some(triggering)) = (response, context.get_mut(ACTION_KEY)) {
                triggering.response = Some(response);
            }
            executed.push(step.id());

            set_progress((index + 1) as f64 / (step_count + 1) as f64);

            if should_break {
                debug!(step_id = step.id(), "Step signalled break, stopping job");
                break;
            }
        }

        let last = executed.iter().rev().find_map(|id| {
            context
                .get(*id)
                .and_then(|action| action.response.clone())
                .map(|response| (*id, response))
        });

        let response = match last {
            None => {
                return Response::noaction(format!("Job '{}' produced no response", self.id))
                    .with_origin(self.origin())
            }
            Some((_, response)) if !response.is_failure() => response,
            Some((step_id, response)) => self.failure_response(step_id, response),
        };

        match &self.postmutation {
            Some(postmutation) => self.mutate_response(postmutation, response, &context),
            None => response,
        }
    }

    /// Sub-meta shared by every dispatched action of one run
    fn sub_meta(&self, meta: &Meta, group_id: Option<&str>) -> Meta {
        Meta {
            ident: meta.ident.clone(),
            project: meta.project.clone(),
            cid: meta.cid.clone(),
            job_id: Some(self.id.clone()),
            gid: group_id.map(str::to_string).or_else(|| meta.id.clone()),
            ..Default::default()
        }
    }

    fn origin(&self) -> String {
        format!("job:{}", self.id)
    }

    /// Wrap a failing step response as the job's response. Contributing
    /// responses are kept with their origin prefixed by this job and step.
    fn failure_response(&self, step_id: &str, response: Response) -> Response {
        let contributing = match &response.responses {
            Some(responses) if !responses.is_empty() => responses.clone(),
            _ => vec![Response {
                responses: None,
                ..response.clone()
            }],
        };

        let message = if self.is_flow {
            match contributing.as_slice() {
                [single] => single.message().unwrap_or("No message").to_string(),
                _ => {
                    let messages: Vec<String> = contributing
                        .iter()
                        .map(|r| format_step_message(r.origin.as_deref().unwrap_or(step_id), r))
                        .collect();
                    format!(
                        "Could not finish job '{}', the following steps failed:{}",
                        self.id,
                        join_messages(&messages, true)
                    )
                }
            }
        } else {
            let messages: Vec<String> = contributing
                .iter()
                .map(|r| r.message().unwrap_or("No message").to_string())
                .collect();
            format!(
                "Could not finish job '{}': {}",
                self.id,
                join_messages(&messages, false)
            )
        };

        let contributing = contributing
            .into_iter()
            .map(|r| prefix_origin(r, &self.id, step_id))
            .collect();

        Response {
            status: response.status,
            data: response.data,
            error: Some(message),
            warning: response.warning,
            origin: Some(self.origin()),
            responses: Some(contributing),
            paging: response.paging,
        }
    }

    /// Run the job postmutation with the triggering action's response set to
    /// the derived response
    fn mutate_response(
        &self,
        postmutation: &Mutator,
        response: Response,
        context: &ContextMap,
    ) -> Response {
        let mut context = context.clone();
        let Some(triggering) = context.get_mut(ACTION_KEY) else {
            return response;
        };
        triggering.response = Some(response.clone());
        let action = triggering.clone();

        match postmutation.mutate(&action, &context) {
            Ok(mutated) => mutated.response.unwrap_or(response),
            Err(e) => {
                warn!(job_id = %self.id, error = %e, "Job postmutation failed");
                Response::error(format!("Job postmutation failed: {}", e))
                    .with_origin(self.origin())
            }
        }
    }
}

fn compile_flow(flow: &[FlowEntry], options: &StepOptions<'_>) -> Result<Vec<Step>, JobError> {
    let mut seen = HashSet::new();
    let mut previous: Option<String> = None;
    let mut steps = Vec::with_capacity(flow.len());

    for entry in flow {
        let step = match entry {
            FlowEntry::Step(definition) => {
                check_step_id(&definition.id, &mut seen)?;
                Step::compile(definition, options, previous.as_deref())?
            }
            FlowEntry::Parallel(definitions) => {
                let children = definitions
                    .iter()
                    .map(|definition| {
                        check_step_id(&definition.id, &mut seen)?;
                        Step::compile(definition, options, previous.as_deref())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Step::parallel(children)?
            }
        };
        previous = Some(step.id().to_string());
        steps.push(step);
    }

    Ok(steps)
}

fn check_step_id<'a>(id: &'a str, seen: &mut HashSet<&'a str>) -> Result<(), JobError> {
    if is_reserved_step_id(id) {
        return Err(JobError::ReservedStepId(id.to_string()));
    }
    if !seen.insert(id) {
        return Err(JobError::InvalidDefinition(format!(
            "Step id '{}' is used more than once",
            id
        )));
    }
    Ok(())
}
