//! Pipeline metrics collection.
//!
//! Provides standardized metrics for monitoring runs:
//! - Task dispatch, retry and outcome counters by kind
//! - Provider call latency histograms
//! - Run outcome counters and assembly duration

use metrics::{counter, gauge, histogram};
use vgen_models::{RunStatus, TaskKind};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Provider dispatches by kind.
    pub const TASK_DISPATCHES_TOTAL: &str = "vgen_task_dispatches_total";

    /// Scheduled task retries by kind.
    pub const TASK_RETRIES_TOTAL: &str = "vgen_task_retries_total";

    /// Task terminal outcomes by kind and outcome.
    pub const TASK_OUTCOMES_TOTAL: &str = "vgen_task_outcomes_total";

    /// Provider call latency in seconds by kind.
    pub const PROVIDER_LATENCY_SECONDS: &str = "vgen_provider_latency_seconds";

    /// Artifacts found already persisted and reused without a provider call.
    pub const ARTIFACTS_REUSED_TOTAL: &str = "vgen_artifacts_reused_total";

    /// Provider calls currently in flight by kind.
    pub const IN_FLIGHT: &str = "vgen_tasks_in_flight";

    /// Finished runs by status.
    pub const RUNS_TOTAL: &str = "vgen_runs_total";

    /// Final assembly duration in seconds.
    pub const ASSEMBLY_SECONDS: &str = "vgen_assembly_seconds";

    /// Storage I/O retries by operation.
    pub const IO_RETRIES_TOTAL: &str = "vgen_io_retries_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_dispatch(kind: TaskKind) {
    counter!(names::TASK_DISPATCHES_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_task_retry(kind: TaskKind) {
    counter!(names::TASK_RETRIES_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record a task reaching a terminal state (`succeeded`, `failed`, `abandoned`).
pub fn record_task_outcome(kind: TaskKind, outcome: &'static str) {
    counter!(
        names::TASK_OUTCOMES_TOTAL,
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_provider_latency(kind: TaskKind, seconds: f64) {
    histogram!(names::PROVIDER_LATENCY_SECONDS, "kind" => kind.as_str()).record(seconds);
}

pub fn record_artifact_reused(kind: TaskKind) {
    counter!(names::ARTIFACTS_REUSED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn set_in_flight(kind: TaskKind, count: usize) {
    gauge!(names::IN_FLIGHT, "kind" => kind.as_str()).set(count as f64);
}

pub fn record_run_finished(status: RunStatus) {
    counter!(names::RUNS_TOTAL, "status" => status.as_str()).increment(1);
}

pub fn record_assembly(seconds: f64) {
    histogram!(names::ASSEMBLY_SECONDS).record(seconds);
}

pub fn record_io_retry(operation: &str) {
    counter!(names::IO_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
