//! Read-only run status projection.
//!
//! This is what callers poll. It is rebuilt from the run and its tasks on
//! every transition and never mutated directly.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::run::{FailureSummary, PipelineRun, RunId, RunStatus, SceneGap};
use crate::task::{Task, TaskError, TaskId, TaskKind, TaskState};

/// Task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunProgress {
    pub succeeded: u32,
    pub total: u32,
    pub in_flight: u32,
    pub failed: u32,
    pub abandoned: u32,
}

impl RunProgress {
    /// Progress percentage (0-100).
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.succeeded as f64 / self.total as f64) * 100.0).round() as u8
    }
}

/// A Failed or Abandoned task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskProblem {
    pub task_id: TaskId,
    pub scene_index: u32,
    pub kind: TaskKind,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<TaskError>,
}

/// Status snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub progress: RunProgress,
    /// Failed tasks first, then Abandoned, each by scene index
    pub problems: Vec<TaskProblem>,
    pub final_artifact: Option<ArtifactRef>,
    pub gaps: Vec<SceneGap>,
    pub failure: Option<FailureSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStatusView {
    /// Project a run and its tasks.
    pub fn project<'a>(run: &PipelineRun, tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut progress = RunProgress::default();
        let mut problems = Vec::new();

        for task in tasks {
            progress.total += 1;
            match task.state {
                TaskState::Succeeded => progress.succeeded += 1,
                TaskState::InFlight => progress.in_flight += 1,
                TaskState::Failed => progress.failed += 1,
                TaskState::Abandoned => progress.abandoned += 1,
                TaskState::Blocked | TaskState::Ready => {}
            }
            if task.state.is_problem() {
                problems.push(TaskProblem {
                    task_id: task.id.clone(),
                    scene_index: task.scene_index,
                    kind: task.kind,
                    state: task.state,
                    attempts: task.attempts,
                    error: task.last_error.clone(),
                });
            }
        }

        problems.sort_by_key(|p| (p.state != TaskState::Failed, p.scene_index, p.kind));

        Self {
            run_id: run.id.clone(),
            status: run.status,
            progress,
            problems,
            final_artifact: run.final_artifact.clone(),
            gaps: run.gaps.clone(),
            failure: run.failure.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{PipelineRequest, SceneSpec};

    #[test]
    fn test_projection_counts_and_orders_problems() {
        let run = PipelineRun::new(
            RunId::from_string("run-1"),
            PipelineRequest::new("tides", vec![SceneSpec::new(0, "a", 4.0)]),
        );

        let mut script = Task::new(0, TaskKind::Script, vec![]);
        script.state = TaskState::Succeeded;
        let mut image = Task::new(0, TaskKind::Image, vec![script.id.clone()]);
        image.state = TaskState::Failed;
        image.attempts = 1;
        image.last_error = Some(TaskError::permanent("policy rejection"));
        let mut clip = Task::new(0, TaskKind::Clip, vec![image.id.clone(), script.id.clone()]);
        clip.state = TaskState::Abandoned;
        clip.last_error = Some(TaskError::upstream(&image.id));
        let mut voice = Task::new(0, TaskKind::Voice, vec![script.id.clone()]);
        voice.state = TaskState::InFlight;

        let tasks = [clip, voice, script, image];
        let view = RunStatusView::project(&run, tasks.iter());

        assert_eq!(view.progress.total, 4);
        assert_eq!(view.progress.succeeded, 1);
        assert_eq!(view.progress.in_flight, 1);
        assert_eq!(view.progress.percentage(), 25);
        assert_eq!(view.problems.len(), 2);
        assert_eq!(view.problems[0].kind, TaskKind::Image);
        assert_eq!(view.problems[1].state, TaskState::Abandoned);
    }
}
