//! Pipeline runs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::ArtifactRef;
use crate::scene::{PipelineRequest, SceneSpec};
use crate::task::{FailureClass, TaskKind};

/// Unique identifier for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not yet scheduled
    #[default]
    Pending,
    Running,
    /// Some scenes completed; final video has gaps
    PartiallyFailed,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scene left out of the final video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SceneGap {
    pub scene_index: u32,
    /// Kinds that did not succeed for this scene
    pub missing: Vec<TaskKind>,
    pub reason: String,
}

/// Why a run ended Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The job graph could not be constructed
    InvalidGraph,
    /// No scene completed
    NoUsableScenes,
    /// Muxing, encoding or uploading the final video failed
    Assembly,
    /// The run deadline passed before the graph drained
    TimedOut,
    /// A run event could not be journaled
    Journal,
}

/// Structured failure summary attached to a Failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FailureSummary {
    pub reason: FailureReason,
    pub message: String,
    /// Most specific scene involved, if any
    #[serde(default)]
    pub scene_index: Option<u32>,
    /// Stage involved, if any
    #[serde(default)]
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub class: Option<FailureClass>,
}

impl FailureSummary {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            scene_index: None,
            kind: None,
            class: None,
        }
    }

    /// Attach the failing stage.
    pub fn at(mut self, scene_index: u32, kind: TaskKind, class: FailureClass) -> Self {
        self.scene_index = Some(scene_index);
        self.kind = Some(kind);
        self.class = Some(class);
        self
    }
}

/// Errors from run state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Run {0} is already terminal ({1})")]
    AlreadyTerminal(RunId, RunStatus),

    #[error("Run {0} cannot finish as {1}")]
    NotTerminal(RunId, RunStatus),
}

/// Aggregate root for one request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    pub id: RunId,
    pub request: PipelineRequest,
    /// Scenes ordered by index
    pub scenes: Vec<SceneSpec>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub gaps: Vec<SceneGap>,
    #[serde(default)]
    pub failure: Option<FailureSummary>,
}

impl PipelineRun {
    /// Create a Pending run.
    pub fn new(id: RunId, request: PipelineRequest) -> Self {
        let scenes = request.ordered_scenes();
        Self {
            id,
            request,
            scenes,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            final_artifact: None,
            gaps: Vec::new(),
            failure: None,
        }
    }

    pub fn mark_running(&mut self) -> Result<(), RunError> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Move to a terminal status. A terminal run is never modified again.
    pub fn finish(
        &mut self,
        status: RunStatus,
        final_artifact: Option<ArtifactRef>,
        gaps: Vec<SceneGap>,
        failure: Option<FailureSummary>,
    ) -> Result<(), RunError> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(RunError::NotTerminal(self.id.clone(), status));
        }
        self.status = status;
        self.final_artifact = final_artifact;
        self.gaps = gaps;
        self.failure = failure;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), RunError> {
        if self.status.is_terminal() {
            return Err(RunError::AlreadyTerminal(self.id.clone(), self.status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> PipelineRun {
        PipelineRun::new(
            RunId::from_string("run-1"),
            PipelineRequest::new(
                "tides",
                vec![SceneSpec::new(1, "b", 4.0), SceneSpec::new(0, "a", 4.0)],
            ),
        )
    }

    #[test]
    fn test_new_run_orders_scenes() {
        let run = sample_run();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.scenes[0].index, 0);
        assert_eq!(run.scenes[1].index, 1);
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let mut run = sample_run();
        run.mark_running().unwrap();
        run.finish(RunStatus::Cancelled, None, vec![], None).unwrap();
        assert!(run.completed_at.is_some());

        let err = run.finish(RunStatus::Succeeded, None, vec![], None).unwrap_err();
        assert_eq!(
            err,
            RunError::AlreadyTerminal(RunId::from_string("run-1"), RunStatus::Cancelled)
        );
        assert!(run.mark_running().is_err());
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_finish_requires_terminal_status() {
        let mut run = sample_run();
        assert!(run.finish(RunStatus::Running, None, vec![], None).is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&RunStatus::PartiallyFailed).unwrap();
        assert_eq!(json, "\"partially_failed\"");
    }
}
