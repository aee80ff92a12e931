//! Durable run journal.
//!
//! Every run lifecycle event and task transition is appended to a per-run
//! log. Replaying the log rebuilds the run and its job graph, which is what
//! `Orchestrator::resume` and `Orchestrator::status` use after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use vgen_models::{
    ArtifactRef, FailureSummary, PipelineRun, RunId, RunStatus, SceneGap, TaskError, TaskId,
};

use crate::error::{JournalError, JournalResult};
use crate::graph::{JobGraph, TaskOutcome};
use crate::retry::{retry_async, RetryPolicy};

/// One journaled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        run: PipelineRun,
    },
    RunStarted,
    TaskDispatched {
        task_id: TaskId,
        attempt: u32,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: TaskError,
    },
    /// Retryable failure observed while the run was stopping; the task is
    /// left Ready without a timer.
    TaskRequeued {
        task_id: TaskId,
        error: TaskError,
    },
    /// Attempt lost to a process restart; rolled back on resume.
    TaskInterrupted {
        task_id: TaskId,
    },
    TaskSucceeded {
        task_id: TaskId,
        artifact: ArtifactRef,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskError,
    },
    TaskAbandoned {
        task_id: TaskId,
        upstream: TaskId,
    },
    AssemblyStarted {
        scenes: Vec<u32>,
    },
    RunFinished {
        status: RunStatus,
        final_artifact: Option<ArtifactRef>,
        #[serde(default)]
        gaps: Vec<SceneGap>,
        #[serde(default)]
        failure: Option<FailureSummary>,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunCreated { .. } => "run_created",
            RunEvent::RunStarted => "run_started",
            RunEvent::TaskDispatched { .. } => "task_dispatched",
            RunEvent::TaskRetryScheduled { .. } => "task_retry_scheduled",
            RunEvent::TaskRequeued { .. } => "task_requeued",
            RunEvent::TaskInterrupted { .. } => "task_interrupted",
            RunEvent::TaskSucceeded { .. } => "task_succeeded",
            RunEvent::TaskFailed { .. } => "task_failed",
            RunEvent::TaskAbandoned { .. } => "task_abandoned",
            RunEvent::AssemblyStarted { .. } => "assembly_started",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }
}

/// A journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub at: DateTime<Utc>,
    pub run_id: RunId,
    #[serde(flatten)]
    pub event: RunEvent,
}

impl JournalRecord {
    pub fn new(run_id: &RunId, event: RunEvent) -> Self {
        Self {
            at: Utc::now(),
            run_id: run_id.clone(),
            event,
        }
    }
}

/// Append-only store of run events.
#[async_trait]
pub trait RunJournal: Send + Sync {
    async fn append(&self, run_id: &RunId, event: RunEvent) -> JournalResult<()>;

    /// All records of a run, in append order.
    async fn load(&self, run_id: &RunId) -> JournalResult<Vec<JournalRecord>>;

    /// Ids of every journaled run, sorted.
    async fn runs(&self) -> JournalResult<Vec<RunId>>;
}

/// Append `event`, retrying I/O failures under `policy`.
///
/// An error here means the event is not durable; callers must not apply
/// the transition it describes.
pub async fn append_with_retry(
    journal: &dyn RunJournal,
    run_id: &RunId,
    event: RunEvent,
    policy: &RetryPolicy,
) -> JournalResult<()> {
    let operation = format!("journal_{}", event.name());
    retry_async(policy, &operation, JournalError::is_retryable, || {
        journal.append(run_id, event.clone())
    })
    .await
}

/// Process-local journal. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: RwLock<HashMap<RunId, Vec<JournalRecord>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunJournal for MemoryJournal {
    async fn append(&self, run_id: &RunId, event: RunEvent) -> JournalResult<()> {
        self.records
            .write()
            .await
            .entry(run_id.clone())
            .or_default()
            .push(JournalRecord::new(run_id, event));
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> JournalResult<Vec<JournalRecord>> {
        self.records
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| JournalError::UnknownRun(run_id.to_string()))
    }

    async fn runs(&self) -> JournalResult<Vec<RunId>> {
        let mut ids: Vec<RunId> = self.records.read().await.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

/// JSON Lines journal: one `{run_id}.jsonl` file per run.
///
/// Each append is written and synced before returning. A torn final line
/// (crash mid-write) is ignored on load.
#[derive(Debug)]
pub struct JsonlJournal {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlJournal {
    pub async fn new(dir: impl Into<PathBuf>) -> JournalResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }
}

#[async_trait]
impl RunJournal for JsonlJournal {
    async fn append(&self, run_id: &RunId, event: RunEvent) -> JournalResult<()> {
        let mut line = serde_json::to_vec(&JournalRecord::new(run_id, event))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(run_id))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> JournalResult<Vec<JournalRecord>> {
        let path = self.path_for(run_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JournalError::UnknownRun(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        parse_records(run_id, &content)
    }

    async fn runs(&self) -> JournalResult<Vec<RunId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(RunId::from_string(stem));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

fn parse_records(run_id: &RunId, content: &str) -> JournalResult<Vec<JournalRecord>> {
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut records = Vec::with_capacity(lines.len());

    for (n, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if n + 1 == lines.len() && !complete => {
                warn!(run_id = %run_id, "Ignoring torn journal line {}: {}", n + 1, e);
            }
            Err(e) => {
                return Err(JournalError::Corrupt {
                    run_id: run_id.to_string(),
                    line: n + 1,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

/// A run rebuilt from its journal.
#[derive(Debug, Clone)]
pub struct RecoveredRun {
    pub run: PipelineRun,
    /// `None` when the job graph could not be built; such a run only has
    /// lifecycle events
    pub graph: Option<JobGraph>,
    /// A `RunFinished` record was found
    pub finished: bool,
}

/// Replay journal records into a run and its graph.
///
/// Tasks still in flight at the end of the log are left InFlight; the
/// caller decides whether to requeue them.
pub fn recover(records: &[JournalRecord]) -> JournalResult<RecoveredRun> {
    let corrupt = |run_id: &str, line: usize, message: String| JournalError::Corrupt {
        run_id: run_id.to_string(),
        line,
        message,
    };

    let (mut run, rest) = match records.split_first() {
        Some((
            JournalRecord {
                event: RunEvent::RunCreated { run },
                ..
            },
            rest,
        )) => (run.clone(), rest),
        Some((first, _)) => {
            return Err(corrupt(
                first.run_id.as_str(),
                1,
                format!("expected run_created, found {}", first.event.name()),
            ))
        }
        None => return Err(JournalError::UnknownRun(String::new())),
    };

    let (mut graph, build_error) = match JobGraph::for_run(&run) {
        Ok(graph) => (Some(graph), None),
        Err(e) => (None, Some(e)),
    };
    let mut finished = false;

    for (n, record) in rest.iter().enumerate() {
        let line = n + 2;
        if record.event.name().starts_with("task_") && graph.is_none() {
            return Err(JournalError::Replay(
                build_error.clone().unwrap_or(crate::error::GraphError::EmptyGraph),
            ));
        }
        match (&record.event, graph.as_mut()) {
            (RunEvent::RunCreated { .. }, _) => {
                return Err(corrupt(run.id.as_str(), line, "duplicate run_created".into()))
            }
            (RunEvent::RunStarted, _) => {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Running;
                }
            }
            (RunEvent::TaskDispatched { task_id, attempt }, Some(graph)) => {
                graph.ready_tasks();
                let recorded = graph.mark_dispatched(task_id)?;
                if recorded != *attempt {
                    return Err(corrupt(
                        run.id.as_str(),
                        line,
                        format!("{} dispatched as attempt {}, replayed as {}", task_id, attempt, recorded),
                    ));
                }
            }
            (RunEvent::TaskRetryScheduled { task_id, error, .. }, Some(graph))
            | (RunEvent::TaskRequeued { task_id, error }, Some(graph)) => {
                graph.mark_retrying(task_id, error.clone())?;
            }
            (RunEvent::TaskInterrupted { task_id }, Some(graph)) => {
                graph.requeue_interrupted(task_id)?;
            }
            (RunEvent::TaskSucceeded { task_id, artifact }, Some(graph)) => {
                graph.mark(task_id, TaskOutcome::Succeeded(artifact.clone()))?;
            }
            (RunEvent::TaskFailed { task_id, error }, Some(graph)) => {
                graph.mark(task_id, TaskOutcome::Failed(error.clone()))?;
            }
            (RunEvent::TaskAbandoned { task_id, upstream }, Some(graph)) => {
                graph.abandon(task_id, upstream)?;
            }
            (RunEvent::AssemblyStarted { .. }, _) => {}
            (
                RunEvent::RunFinished {
                    status,
                    final_artifact,
                    gaps,
                    failure,
                },
                _,
            ) => {
                run.finish(*status, final_artifact.clone(), gaps.clone(), failure.clone())
                    .map_err(|e| corrupt(run.id.as_str(), line, e.to_string()))?;
                finished = true;
            }
            // Task events without a graph were rejected above
            (_, None) => {}
        }
    }
    if let Some(graph) = graph.as_mut() {
        graph.ready_tasks();
    }

    debug!(
        run_id = %run.id,
        records = records.len(),
        finished,
        "Recovered run from journal"
    );

    Ok(RecoveredRun {
        run,
        graph,
        finished,
    })
}
