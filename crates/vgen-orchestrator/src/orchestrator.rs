//! Orchestrator facade.
//!
//! Accepts requests, drives each run on its own task (schedule, then
//! assemble, then settle) and exposes read-only status snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use vgen_media::Composer;
use vgen_models::{
    ArtifactRef, FailureReason, FailureSummary, PipelineRequest, PipelineRun, RunId, RunStatus,
    RunStatusView, SceneGap, TaskState,
};
use vgen_providers::ProviderSet;
use vgen_storage::{run_prefix, ArtifactStore, StorageError};

use crate::assembly::{self, AssemblyEngine, AssemblyPlan};
use crate::config::OrchestratorConfig;
use crate::error::{GraphError, JournalError, OrchestratorError, OrchestratorResult};
use crate::graph::JobGraph;
use crate::journal::{append_with_retry, recover, RunEvent, RunJournal};
use crate::logging::RunLogger;
use crate::metrics;
use crate::retry::retry_async;
use crate::scheduler::{ScheduleOutcome, Scheduler, SchedulerLimits, StopReason};

/// Caller's view of a run: status snapshots, cancellation, completion.
#[derive(Clone)]
pub struct RunHandle {
    run_id: RunId,
    status_rx: watch::Receiver<RunStatusView>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Current status snapshot.
    pub fn status(&self) -> RunStatusView {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<RunStatusView> {
        self.status_rx.clone()
    }

    /// Request cooperative cancellation. In-flight provider calls finish;
    /// nothing new is dispatched.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Wait until the run is terminal.
    pub async fn wait(&self) -> RunStatusView {
        let mut rx = self.status_rx.clone();
        loop {
            {
                let view = rx.borrow_and_update();
                if view.is_terminal() {
                    return view.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("status", &self.status_rx.borrow().status)
            .finish()
    }
}

/// How a run ends once scheduling stops.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    /// Terminal without assembly
    Finish {
        status: RunStatus,
        gaps: Vec<SceneGap>,
        failure: Option<FailureSummary>,
    },
    /// Assemble the planned scenes
    Assemble,
}

/// Decide a run's fate from how scheduling ended and what completed.
pub(crate) fn verdict(stop: Option<StopReason>, plan: &AssemblyPlan, graph: &JobGraph) -> Verdict {
    match stop {
        Some(StopReason::Cancelled) => Verdict::Finish {
            status: RunStatus::Cancelled,
            gaps: Vec::new(),
            failure: None,
        },
        Some(StopReason::TimedOut) => {
            let unfinished = graph.tasks().iter().filter(|t| !t.state.is_terminal()).count();
            Verdict::Finish {
                status: RunStatus::Failed,
                gaps: Vec::new(),
                failure: Some(FailureSummary::new(
                    FailureReason::TimedOut,
                    format!("run deadline passed with {} tasks unfinished", unfinished),
                )),
            }
        }
        Some(StopReason::JournalUnavailable) => Verdict::Finish {
            status: RunStatus::Failed,
            gaps: Vec::new(),
            failure: Some(FailureSummary::new(
                FailureReason::Journal,
                "a task transition could not be journaled; scheduling stopped",
            )),
        },
        None if plan.bundles.is_empty() => {
            let failed = graph
                .tasks()
                .iter()
                .find(|t| t.state == TaskState::Failed);
            let failure = match failed {
                Some(task) => {
                    let error = task.last_error.clone();
                    let message = error
                        .as_ref()
                        .map(|e| format!("no scene completed; {} failed: {}", task.id, e))
                        .unwrap_or_else(|| format!("no scene completed; {} failed", task.id));
                    let summary = FailureSummary::new(FailureReason::NoUsableScenes, message);
                    match error {
                        Some(e) => summary.at(task.scene_index, task.kind, e.class),
                        None => summary,
                    }
                }
                None => FailureSummary::new(FailureReason::NoUsableScenes, "no scene completed"),
            };
            Verdict::Finish {
                status: RunStatus::Failed,
                gaps: plan.gaps.clone(),
                failure: Some(failure),
            }
        }
        None => Verdict::Assemble,
    }
}

struct Inner {
    config: OrchestratorConfig,
    providers: ProviderSet,
    store: Arc<dyn ArtifactStore>,
    journal: Arc<dyn RunJournal>,
    engine: AssemblyEngine,
    active: RwLock<HashMap<RunId, RunHandle>>,
}

/// Entry point for submitting, resuming, polling and cancelling runs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        providers: ProviderSet,
        store: Arc<dyn ArtifactStore>,
        journal: Arc<dyn RunJournal>,
        composer: Arc<dyn Composer>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let missing = providers.missing_kinds();
        if !missing.is_empty() {
            warn!("No provider registered for {:?}; those tasks will fail", missing);
        }

        let engine = AssemblyEngine::new(
            Arc::clone(&store),
            composer,
            config.work_dir.join("assembly"),
            config.io_retry,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                providers,
                store,
                journal,
                engine,
                active: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Accept a request and start its run. Returns as soon as the run is
    /// journaled; generation proceeds in the background.
    pub async fn submit(&self, request: PipelineRequest) -> OrchestratorResult<RunHandle> {
        request.check()?;

        let run = PipelineRun::new(RunId::new(), request);
        self.inner
            .journal
            .append(&run.id, RunEvent::RunCreated { run: run.clone() })
            .await?;
        info!(run_id = %run.id, scenes = run.scenes.len(), "Accepted pipeline request");

        let graph = JobGraph::for_run(&run);
        self.start(run, graph).await
    }

    /// Continue a run from its journal after a restart.
    ///
    /// Tasks that were in flight when the process died are requeued; their
    /// artifacts are reused if they were persisted. A finished run yields a
    /// handle that is already terminal.
    pub async fn resume(&self, run_id: &RunId) -> OrchestratorResult<RunHandle> {
        if let Some(handle) = self.handle(run_id).await {
            return Err(OrchestratorError::AlreadyActive(handle.run_id.to_string()));
        }

        let records = self.load(run_id).await?;
        let recovered = recover(&records)?;

        if recovered.finished {
            let view = project(&recovered.run, recovered.graph.as_ref());
            let (_status_tx, status_rx) = watch::channel(view);
            let (cancel_tx, _) = watch::channel(false);
            return Ok(RunHandle {
                run_id: run_id.clone(),
                status_rx,
                cancel_tx: Arc::new(cancel_tx),
            });
        }

        let graph = match recovered.graph {
            Some(mut graph) => {
                for task_id in graph.requeue_in_flight() {
                    self.inner
                        .journal
                        .append(run_id, RunEvent::TaskInterrupted { task_id })
                        .await?;
                }
                Ok(graph)
            }
            None => JobGraph::for_run(&recovered.run),
        };

        info!(run_id = %run_id, "Resuming run from journal");
        self.start(recovered.run, graph).await
    }

    /// Status of an active run, or of a journaled one.
    pub async fn status(&self, run_id: &RunId) -> OrchestratorResult<RunStatusView> {
        if let Some(handle) = self.handle(run_id).await {
            return Ok(handle.status());
        }
        let records = self.load(run_id).await?;
        let recovered = recover(&records)?;
        Ok(project(&recovered.run, recovered.graph.as_ref()))
    }

    /// Cancel an active run. Cancelling a run that is not active is a no-op.
    pub async fn cancel(&self, run_id: &RunId) -> OrchestratorResult<()> {
        if let Some(handle) = self.handle(run_id).await {
            handle.cancel();
            return Ok(());
        }
        self.load(run_id).await.map(|_| ())
    }

    /// Delete every stored artifact of an inactive run. Returns the number
    /// of objects removed. The journal is kept, so status stays readable;
    /// resuming an unfinished purged run regenerates its artifacts.
    pub async fn purge(&self, run_id: &RunId) -> OrchestratorResult<u32> {
        if let Some(handle) = self.handle(run_id).await {
            return Err(OrchestratorError::AlreadyActive(handle.run_id.to_string()));
        }
        self.load(run_id).await?;

        let prefix = run_prefix(run_id);
        let removed = retry_async(
            &self.inner.config.io_retry,
            "purge_run",
            StorageError::is_retryable,
            || self.inner.store.delete_prefix(&prefix),
        )
        .await?;
        info!(run_id = %run_id, removed, "Purged run artifacts");
        Ok(removed)
    }

    pub async fn handle(&self, run_id: &RunId) -> Option<RunHandle> {
        self.inner.active.read().await.get(run_id).cloned()
    }

    /// Ids of every run in the journal.
    pub async fn runs(&self) -> OrchestratorResult<Vec<RunId>> {
        Ok(self.inner.journal.runs().await?)
    }

    async fn load(&self, run_id: &RunId) -> OrchestratorResult<Vec<crate::journal::JournalRecord>> {
        match self.inner.journal.load(run_id).await {
            Ok(records) => Ok(records),
            Err(JournalError::UnknownRun(_)) => Err(OrchestratorError::UnknownRun(run_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn start(
        &self,
        run: PipelineRun,
        graph: Result<JobGraph, GraphError>,
    ) -> OrchestratorResult<RunHandle> {
        let view = project(&run, graph.as_ref().ok());
        let (status_tx, status_rx) = watch::channel(view);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = RunHandle {
            run_id: run.id.clone(),
            status_rx,
            cancel_tx: Arc::new(cancel_tx),
        };

        {
            let mut active = self.inner.active.write().await;
            if active.contains_key(&run.id) {
                return Err(OrchestratorError::AlreadyActive(run.id.to_string()));
            }
            active.insert(run.id.clone(), handle.clone());
        }

        let inner = Arc::clone(&self.inner);
        let status_tx = Arc::new(status_tx);
        tokio::spawn(async move {
            let run_id = run.id.clone();
            drive(&inner, run, graph, cancel_rx, status_tx).await;
            inner.active.write().await.remove(&run_id);
        });

        Ok(handle)
    }
}

fn project(run: &PipelineRun, graph: Option<&JobGraph>) -> RunStatusView {
    match graph {
        Some(graph) => RunStatusView::project(run, graph.tasks()),
        None => RunStatusView::project(run, std::iter::empty()),
    }
}

/// Schedule, assemble and settle one run.
async fn drive(
    inner: &Inner,
    mut run: PipelineRun,
    graph: Result<JobGraph, GraphError>,
    cancel_rx: watch::Receiver<bool>,
    status_tx: Arc<watch::Sender<RunStatusView>>,
) {
    let logger = RunLogger::new(&run.id, "run");
    let run_id = run.id.clone();
    let journal = |event: RunEvent| {
        let journal = Arc::clone(&inner.journal);
        let run_id = run_id.clone();
        let policy = inner.config.io_retry;
        async move { append_with_retry(journal.as_ref(), &run_id, event, &policy).await }
    };
    let journal_failure = |e: JournalError| {
        logger.log_error(&format!("journal append failed: {}", e));
        FailureSummary::new(FailureReason::Journal, e.to_string())
    };

    let graph = match graph {
        Ok(graph) => graph,
        Err(e) => {
            logger.log_error(&format!("invalid job graph: {}", e));
            let failure = FailureSummary::new(FailureReason::InvalidGraph, e.to_string());
            settle(&mut run, RunStatus::Failed, None, Vec::new(), Some(failure), &logger);
            if let Err(e) = journal(finished_event(&run)).await {
                journal_failure(e);
            }
            status_tx.send_replace(project(&run, None));
            return;
        }
    };

    if run.status != RunStatus::Running {
        if let Err(e) = journal(RunEvent::RunStarted).await {
            let failure = journal_failure(e);
            settle(&mut run, RunStatus::Failed, None, Vec::new(), Some(failure), &logger);
            if let Err(e) = journal(finished_event(&run)).await {
                journal_failure(e);
            }
            status_tx.send_replace(project(&run, Some(&graph)));
            return;
        }
        if let Err(e) = run.mark_running() {
            logger.log_error(&e.to_string());
            return;
        }
    }

    let limits = SchedulerLimits {
        concurrency: inner.config.concurrency,
        call_timeouts: inner.config.call_timeouts,
        retry: inner.config.retry,
        io_retry: inner.config.io_retry,
        deadline: inner.config.run_timeout.map(|timeout| Instant::now() + timeout),
    };
    let scheduler = Scheduler::new(
        &run,
        inner.providers.clone(),
        Arc::clone(&inner.store),
        Arc::clone(&inner.journal),
        limits,
        cancel_rx,
        Arc::clone(&status_tx),
    );
    let ScheduleOutcome { mut run, graph, stop } = scheduler.run(run, graph).await;

    let plan = assembly::plan(&graph);
    let (status, final_artifact, gaps, failure) = match verdict(stop, &plan, &graph) {
        Verdict::Finish {
            status,
            gaps,
            failure,
        } => (status, None, gaps, failure),
        Verdict::Assemble => {
            let started = RunEvent::AssemblyStarted {
                scenes: plan.scene_indices(),
            };
            match journal(started).await {
                Err(e) => (
                    RunStatus::Failed,
                    None,
                    plan.gaps.clone(),
                    Some(journal_failure(e)),
                ),
                Ok(()) => match inner.engine.assemble(&run.id, &plan).await {
                    Ok(artifact) => {
                        let status = if plan.gaps.is_empty() {
                            RunStatus::Succeeded
                        } else {
                            RunStatus::PartiallyFailed
                        };
                        (status, Some(artifact), plan.gaps.clone(), None)
                    }
                    Err(e) => {
                        logger.log_error(&format!("assembly failed: {}", e));
                        let mut failure =
                            FailureSummary::new(FailureReason::Assembly, e.to_string());
                        failure.scene_index = e.scene_index();
                        (RunStatus::Failed, None, plan.gaps.clone(), Some(failure))
                    }
                },
            }
        }
    };

    settle(&mut run, status, final_artifact, gaps, failure, &logger);
    // Journaled before it becomes visible, so a woken waiter can resume from it.
    // If it cannot be journaled the run stays resumable after a restart.
    if let Err(e) = journal(finished_event(&run)).await {
        journal_failure(e);
    }
    status_tx.send_replace(project(&run, Some(&graph)));
}

/// Move the run to its terminal status and report it.
fn settle(
    run: &mut PipelineRun,
    status: RunStatus,
    final_artifact: Option<ArtifactRef>,
    gaps: Vec<SceneGap>,
    failure: Option<FailureSummary>,
    logger: &RunLogger,
) {
    if let Err(e) = run.finish(status, final_artifact, gaps, failure) {
        logger.log_error(&e.to_string());
    }
    metrics::record_run_finished(run.status);

    let summary = match (&run.final_artifact, &run.failure) {
        (Some(artifact), _) => format!("{} -> {}", run.status, artifact.key),
        (None, Some(failure)) => format!("{}: {}", run.status, failure.message),
        (None, None) => run.status.to_string(),
    };
    if run.gaps.is_empty() {
        logger.log_completion(&summary);
    } else {
        let missing: Vec<u32> = run.gaps.iter().map(|g| g.scene_index).collect();
        logger.log_completion(&format!("{} (missing scenes {:?})", summary, missing));
    }
}

fn finished_event(run: &PipelineRun) -> RunEvent {
    RunEvent::RunFinished {
        status: run.status,
        final_artifact: run.final_artifact.clone(),
        gaps: run.gaps.clone(),
        failure: run.failure.clone(),
    }
}
