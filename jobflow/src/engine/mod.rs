// Flow execution engine: jobs, steps, conditions and mutations

pub mod aggregate;
pub mod conditions;
pub mod context;
pub mod job;
pub mod mutation;
pub mod step;

pub use conditions::{ConditionKind, ConditionOutcome, Conditions};
pub use context::{ContextMap, ACTION_KEY, CURRENT_ACTION_KEY, GROUP_ID_SEPARATOR};
pub use job::Job;
pub use mutation::{MutationDefinition, Mutator};
pub use step::{Step, StepOptions, StepOutcome};

/// Engine-wide defaults applied when compiling jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Steps without postconditions fail on their own failing response
    /// instead of the previous step's. A job definition may override this.
    pub fail_on_error_in_postconditions: bool,
    /// Iteration concurrency for steps that do not set `iterateConcurrency`
    pub default_iterate_concurrency: usize,
    /// Timezone for schedules of jobs that do not set `tz`
    pub default_timezone: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fail_on_error_in_postconditions: false,
            default_iterate_concurrency: 1,
            default_timezone: None,
        }
    }
}
