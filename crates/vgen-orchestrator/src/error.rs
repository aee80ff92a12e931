//! Orchestrator error types.

use thiserror::Error;
use vgen_models::{TaskId, TaskState};

pub type GraphResult<T> = Result<T, GraphError>;
pub type JournalResult<T> = Result<T, JournalError>;
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Job graph construction and transition errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Graph has no tasks")]
    EmptyGraph,

    #[error("Duplicate scene index {0}")]
    DuplicateScene(u32),

    #[error("Duplicate task {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: TaskId, dependency: TaskId },

    #[error("Task {task} depends on later scene task {dependency}")]
    ForwardSceneDependency { task: TaskId, dependency: TaskId },

    #[error("Dependency cycle through {0:?}")]
    Cycle(Vec<TaskId>),

    #[error("Unknown task {0}")]
    UnknownTask(TaskId),

    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

impl GraphError {
    pub fn invalid_transition(task: &TaskId, from: TaskState, to: TaskState) -> Self {
        Self::InvalidTransition {
            task: task.clone(),
            from,
            to,
        }
    }
}

/// Final assembly errors. Fatal to the run.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("No complete scenes to assemble")]
    NothingToAssemble,

    #[error("Failed to fetch scene {scene_index} input: {source}")]
    Fetch {
        scene_index: u32,
        #[source]
        source: vgen_storage::StorageError,
    },

    #[error("Failed to mux scene {scene_index}: {source}")]
    Mux {
        scene_index: u32,
        #[source]
        source: vgen_media::MediaError,
    },

    #[error("Failed to concatenate scenes: {0}")]
    Concat(#[source] vgen_media::MediaError),

    #[error("Failed to store final video: {0}")]
    Upload(#[source] vgen_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssemblyError {
    /// Scene the failure is attributable to, if any.
    pub fn scene_index(&self) -> Option<u32> {
        match self {
            AssemblyError::Fetch { scene_index, .. } | AssemblyError::Mux { scene_index, .. } => {
                Some(*scene_index)
            }
            _ => None,
        }
    }
}

/// Run journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("No journal for run {0}")]
    UnknownRun(String),

    #[error("Journal for run {run_id} is corrupt at line {line}: {message}")]
    Corrupt {
        run_id: String,
        line: usize,
        message: String,
    },

    #[error("Journal replay failed: {0}")]
    Replay(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JournalError {
    /// Only I/O failures can clear up on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JournalError::Io(_))
    }
}

/// Errors surfaced by the orchestrator facade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidRequest(#[from] vgen_models::RequestError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown run {0}")]
    UnknownRun(String),

    #[error("Run {0} is already active")]
    AlreadyActive(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Storage error: {0}")]
    Storage(#[from] vgen_storage::StorageError),
}

impl OrchestratorError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
