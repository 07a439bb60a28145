// Job and step flow execution engine for an action based integration hub
//
// A job is compiled once from its definition and run per triggering action.
// Steps run in sequence; a step may fan out over parallel child steps or
// iterate its action over items with a concurrency cap. Every dispatch goes
// through the caller's `Dispatcher`.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod schedule;
pub mod telemetry;

pub use dispatch::Dispatcher;
pub use engine::{EngineOptions, Job, Step, StepOutcome};
pub use errors::{EvaluationError, JobError, ScheduleError};
pub use models::{Action, JobDefinition, Meta, Response, Status, StepDefinition};
pub use pipeline::{Evaluator, PathEvaluator, Pipeline};
pub use schedule::Schedule;
