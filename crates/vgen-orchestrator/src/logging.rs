//! Structured run logging utilities.
//!
//! Provides consistent, structured logging for pipeline runs with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};
use vgen_models::{RunId, TaskId};

/// Run logger for structured logging with consistent formatting.
///
/// Every line carries the run ID and the phase (`scheduling`, `assembly`).
#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
    phase: String,
}

impl RunLogger {
    pub fn new(run_id: &RunId, phase: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
        }
    }

    /// Same run, different phase.
    pub fn phase(&self, phase: &str) -> Self {
        Self {
            run_id: self.run_id.clone(),
            phase: phase.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            phase = %self.phase,
            "Run started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            phase = %self.phase,
            "Run progress: {}", message
        );
    }

    /// Log a task-level event.
    pub fn log_task(&self, task_id: &TaskId, message: &str) {
        info!(
            run_id = %self.run_id,
            phase = %self.phase,
            task_id = %task_id,
            "{}", message
        );
    }

    pub fn log_task_warning(&self, task_id: &TaskId, message: &str) {
        warn!(
            run_id = %self.run_id,
            phase = %self.phase,
            task_id = %task_id,
            "{}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            run_id = %self.run_id,
            phase = %self.phase,
            "Run warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            run_id = %self.run_id,
            phase = %self.phase,
            "Run error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            phase = %self.phase,
            "Run completed: {}", message
        );
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase_name(&self) -> &str {
        &self.phase
    }

    /// Create a tracing span for this run.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "run",
            run_id = %self.run_id,
            phase = %self.phase
        )
    }
}
