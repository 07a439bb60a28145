// Telemetry module for structured logging and metrics
//
// Metrics are recorded through the `metrics` facade. Nothing is exported
// unless the embedding application installs a recorder.

use crate::models::Status;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// Sets up the tracing subscriber with:
/// - Log levels from `RUST_LOG`, falling back to `log_level`
/// - JSON formatting with span context when `json` is set, compact text otherwise
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Describe all engine metrics to the installed recorder
pub fn describe_metrics() {
    describe_counter!("jobflow_job_runs_total", "Total number of job runs by final status");
    describe_counter!("jobflow_step_runs_total", "Total number of step runs by status");
    describe_counter!(
        "jobflow_dispatch_errors_total",
        "Total number of dispatch calls that returned an error"
    );
    describe_histogram!("jobflow_job_duration_seconds", "Duration of job runs in seconds");
}

/// Record a finished job run
#[inline]
pub fn record_job_run(job_id: &str, status: Status, duration: Duration) {
    counter!("jobflow_job_runs_total", "status" => status.as_str()).increment(1);
    histogram!("jobflow_job_duration_seconds", "job_id" => job_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a finished step
#[inline]
pub fn record_step_run(status: Status) {
    counter!("jobflow_step_runs_total", "status" => status.as_str()).increment(1);
}

/// Record a dispatch call that failed with an error
#[inline]
pub fn record_dispatch_error() {
    counter!("jobflow_dispatch_errors_total").increment(1);
}
