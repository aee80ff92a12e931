//! Generation tasks and their lifecycle.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::artifact::{ArtifactRef, ContentKind};

/// Capability a task is dispatched to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Run-wide plan every script follows. Only built when requested.
    Outline,
    Script,
    Image,
    Clip,
    Voice,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Outline,
        TaskKind::Script,
        TaskKind::Image,
        TaskKind::Clip,
        TaskKind::Voice,
    ];

    /// Kinds built for every scene, in construction order.
    pub const SCENE: [TaskKind; 4] = [
        TaskKind::Script,
        TaskKind::Image,
        TaskKind::Clip,
        TaskKind::Voice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Outline => "outline",
            TaskKind::Script => "script",
            TaskKind::Image => "image",
            TaskKind::Clip => "clip",
            TaskKind::Voice => "voice",
        }
    }

    /// Content kind of the artifact this task produces.
    pub fn output_kind(&self) -> ContentKind {
        match self {
            TaskKind::Outline | TaskKind::Script => ContentKind::Script,
            TaskKind::Image => ContentKind::Image,
            TaskKind::Clip => ContentKind::Video,
            TaskKind::Voice => ContentKind::Audio,
        }
    }

    /// Kinds (within the same scene) this kind depends on. A script also
    /// depends on the run's outline when there is one.
    pub fn upstream(&self) -> &'static [TaskKind] {
        match self {
            TaskKind::Outline | TaskKind::Script => &[],
            TaskKind::Image => &[TaskKind::Script],
            TaskKind::Clip => &[TaskKind::Image, TaskKind::Script],
            TaskKind::Voice => &[TaskKind::Script],
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "outline" => Ok(TaskKind::Outline),
            "script" => Ok(TaskKind::Script),
            "image" => Ok(TaskKind::Image),
            "clip" => Ok(TaskKind::Clip),
            "voice" => Ok(TaskKind::Voice),
            other => Err(format!("unknown task kind: {}", other)),
        }
    }
}

/// Deterministic task identifier, derived from scene index and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Identifier of the `kind` task of scene `scene_index`.
    pub fn for_scene(scene_index: u32, kind: TaskKind) -> Self {
        Self(format!("scene-{:03}-{}", scene_index, kind.as_str()))
    }

    /// Identifier of the run's outline task.
    pub fn outline() -> Self {
        Self(TaskKind::Outline.as_str().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on at least one dependency
    #[default]
    Blocked,
    /// All dependencies succeeded; waiting for a worker slot
    Ready,
    /// An attempt is running
    InFlight,
    Succeeded,
    /// Permanently failed (non-retryable error or retries exhausted)
    Failed,
    /// Never dispatched because an upstream task failed
    Abandoned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Blocked => "blocked",
            TaskState::Ready => "ready",
            TaskState::InFlight => "in_flight",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Abandoned => "abandoned",
        }
    }

    /// Check if this is a terminal state (no more transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Abandoned
        )
    }

    /// Failed or Abandoned.
    pub fn is_problem(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Abandoned)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Rate limit, 5xx, storage hiccup
    Transient,
    /// Provider call exceeded its deadline
    Timeout,
    /// Invalid or policy-rejected input
    Permanent,
    /// An upstream task failed (Abandoned tasks only)
    Upstream,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Timeout => "timeout",
            FailureClass::Permanent => "permanent",
            FailureClass::Upstream => "upstream",
        }
    }

    /// Timeouts are retried like any other transient failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Timeout)
    }
}

/// Last error recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    pub class: FailureClass,
    pub message: String,
}

impl TaskError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Timeout, message)
    }

    /// Error recorded on a task abandoned because `upstream` failed.
    pub fn upstream(upstream: &TaskId) -> Self {
        Self::new(
            FailureClass::Upstream,
            format!("upstream task {} failed", upstream),
        )
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class.as_str(), self.message)
    }
}

/// One unit of generation work within a scene.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub scene_index: u32,
    /// Tasks that must succeed before this one is Ready
    pub dependencies: Vec<TaskId>,
    pub state: TaskState,
    /// Number of dispatched attempts
    pub attempts: u32,
    pub last_error: Option<TaskError>,
    pub artifact: Option<ArtifactRef>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a Blocked task with no attempts.
    pub fn new(scene_index: u32, kind: TaskKind, dependencies: Vec<TaskId>) -> Self {
        Self::with_id(TaskId::for_scene(scene_index, kind), scene_index, kind, dependencies)
    }

    /// The run's outline task. It is placed on the first scene so that
    /// every script may depend on it.
    pub fn outline(first_scene: u32) -> Self {
        Self::with_id(TaskId::outline(), first_scene, TaskKind::Outline, Vec::new())
    }

    fn with_id(id: TaskId, scene_index: u32, kind: TaskKind, dependencies: Vec<TaskId>) -> Self {
        Self {
            id,
            kind,
            scene_index,
            dependencies,
            state: TaskState::Blocked,
            attempts: 0,
            last_error: None,
            artifact: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_deterministic() {
        assert_eq!(
            TaskId::for_scene(7, TaskKind::Clip).as_str(),
            "scene-007-clip"
        );
        assert_eq!(
            TaskId::for_scene(7, TaskKind::Clip),
            TaskId::for_scene(7, TaskKind::Clip)
        );
    }

    #[test]
    fn test_outline_is_run_wide() {
        let outline = Task::outline(0);
        assert_eq!(outline.id.as_str(), "outline");
        assert_eq!(outline.kind, TaskKind::Outline);
        assert!(outline.dependencies.is_empty());
        assert!(!TaskKind::SCENE.contains(&TaskKind::Outline));
        assert_eq!(TaskKind::Outline.output_kind(), ContentKind::Script);
    }

    #[test]
    fn test_upstream_kinds() {
        assert!(TaskKind::Script.upstream().is_empty());
        assert_eq!(TaskKind::Image.upstream(), &[TaskKind::Script]);
        assert_eq!(
            TaskKind::Clip.upstream(),
            &[TaskKind::Image, TaskKind::Script]
        );
        assert_eq!(TaskKind::Voice.upstream(), &[TaskKind::Script]);
    }

    #[test]
    fn test_failure_class_retryable() {
        assert!(FailureClass::Transient.is_retryable());
        assert!(FailureClass::Timeout.is_retryable());
        assert!(!FailureClass::Permanent.is_retryable());
        assert!(!FailureClass::Upstream.is_retryable());
    }

    #[test]
    fn test_task_state_serde() {
        let json = serde_json::to_string(&TaskState::InFlight).unwrap();
        assert_eq!(json, "\"in_flight\"");
        assert!(TaskState::Abandoned.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Voice".parse::<TaskKind>().unwrap(), TaskKind::Voice);
        assert_eq!("outline".parse::<TaskKind>().unwrap(), TaskKind::Outline);
        assert!("storyboard".parse::<TaskKind>().is_err());
    }
}
