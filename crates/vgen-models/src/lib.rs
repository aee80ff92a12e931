//! Shared data models for the VGen pipeline orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - Pipeline requests and scene specs
//! - Generation tasks and their lifecycle states
//! - Artifact references
//! - Pipeline runs and the read-only status projection
//! - Render settings for final assembly

pub mod artifact;
pub mod encoding;
pub mod run;
pub mod scene;
pub mod status;
pub mod task;

// Re-export common types
pub use artifact::{ArtifactRef, ContentKind};
pub use encoding::{AudioPolicy, RenderSettings};
pub use run::{FailureReason, FailureSummary, PipelineRun, RunError, RunId, RunStatus, SceneGap};
pub use scene::{PipelineRequest, RequestError, SceneSpec};
pub use status::{RunProgress, RunStatusView, TaskProblem};
pub use task::{FailureClass, Task, TaskError, TaskId, TaskKind, TaskState};
