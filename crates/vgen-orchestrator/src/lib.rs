//! Generative video pipeline orchestrator.
//!
//! This crate provides:
//! - Job graph construction with dependency-counted readiness
//! - A scheduler with per-kind concurrency budgets, retry/backoff and
//!   cooperative cancellation
//! - Deterministic, index-ordered final assembly
//! - A durable run journal for status and resume after restart
//! - The `Orchestrator` facade and read-only run status

pub mod assembly;
pub mod config;
pub mod error;
pub mod graph;
pub mod journal;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;

pub use assembly::{AssemblyEngine, AssemblyPlan, SceneBundle};
pub use config::{OrchestratorConfig, PerKind};
pub use error::{AssemblyError, GraphError, JournalError, OrchestratorError, OrchestratorResult};
pub use graph::{JobGraph, StateCounts, TaskOutcome};
pub use journal::{append_with_retry, JournalRecord, JsonlJournal, MemoryJournal, RunEvent, RunJournal};
pub use logging::RunLogger;
pub use orchestrator::{Orchestrator, RunHandle};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{ScheduleOutcome, Scheduler, SchedulerLimits, StopReason};
