//! Scheduler: drains a job graph through the generation providers.
//!
//! One control loop owns the graph and the run. Attempts run as spawned
//! futures in a `JoinSet` and report back to the loop, which serializes every
//! state transition. Per-kind semaphores bound the calls in flight, and a task
//! only has an attempt in flight while it is InFlight on the graph, so two
//! attempts of one task never overlap.
//!
//! Cancellation and the run deadline are cooperative: once either fires no
//! new attempt starts, pending retry timers are dropped, and the loop waits
//! for in-flight calls to resolve.
//!
//! Every transition is journaled before it is applied to the graph. If an
//! append still fails after the I/O retries, the run stops and later reports
//! are left unapplied, so the journal never lags the in-memory graph.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use vgen_models::{
    ArtifactRef, PipelineRequest, PipelineRun, RunId, RunStatusView, SceneSpec, TaskError,
    TaskId, TaskKind, TaskState,
};
use vgen_providers::{GeneratedArtifact, GenerationProvider, GenerationRequest, ProviderSet};
use vgen_storage::{outline_key, scene_key, ArtifactStore, StorageError};

use crate::config::PerKind;
use crate::graph::{JobGraph, TaskOutcome};
use crate::error::{JournalError, JournalResult};
use crate::journal::{append_with_retry, RunEvent, RunJournal};
use crate::logging::RunLogger;
use crate::metrics;
use crate::retry::{RetryDecision, RetryPolicy};

/// Why scheduling stopped before the graph drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
    /// A transition could not be journaled
    JournalUnavailable,
}

/// Result of driving a graph.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub run: PipelineRun,
    pub graph: JobGraph,
    /// `None` when the graph drained
    pub stop: Option<StopReason>,
}

/// Scheduling limits.
#[derive(Debug, Clone)]
pub struct SchedulerLimits {
    pub concurrency: PerKind<usize>,
    pub call_timeouts: PerKind<Duration>,
    pub retry: RetryPolicy,
    /// Retries for journal appends
    pub io_retry: RetryPolicy,
    pub deadline: Option<Instant>,
}

/// What one attempt produced.
#[derive(Debug)]
struct AttemptReport {
    task_id: TaskId,
    kind: TaskKind,
    attempt: u32,
    result: Result<AttemptSuccess, AttemptFailure>,
}

#[derive(Debug)]
struct AttemptSuccess {
    artifact: ArtifactRef,
    /// Found already persisted; the provider was not called
    reused: bool,
    provider_latency: Option<Duration>,
    /// Media duration reported by the provider
    duration_secs: Option<f64>,
}

#[derive(Debug)]
struct AttemptFailure {
    error: TaskError,
    /// Generated bytes that could not be persisted. Kept so the next attempt
    /// stores them instead of calling the provider again.
    unsaved: Option<GeneratedArtifact>,
}

impl AttemptFailure {
    fn new(error: TaskError) -> Self {
        Self {
            error,
            unsaved: None,
        }
    }
}

/// Everything an attempt needs, owned so it can be spawned.
struct Attempt {
    request: GenerationRequest,
    key: String,
    provider: Option<Arc<dyn GenerationProvider>>,
    store: Arc<dyn ArtifactStore>,
    timeout: Duration,
    unsaved: Option<GeneratedArtifact>,
}

impl Attempt {
    async fn execute(self) -> Result<AttemptSuccess, AttemptFailure> {
        let kind = self.request.kind;
        let task_id = &self.request.task_id;
        let content_kind = kind.output_kind();

        // A previous attempt (or process) may already have persisted this
        // artifact; keys are deterministic, so reuse it.
        match self.store.existing(&self.key, content_kind, Some(task_id)).await {
            Ok(Some(artifact)) => {
                return Ok(AttemptSuccess {
                    artifact,
                    reused: true,
                    provider_latency: None,
                    duration_secs: None,
                })
            }
            Ok(None) => {}
            Err(e) => {
                return Err(AttemptFailure::new(TaskError::transient(format!(
                    "artifact store check failed: {}",
                    e
                ))))
            }
        }

        let (generated, provider_latency) = match self.unsaved {
            Some(generated) => (generated, None),
            None => {
                let provider = self.provider.ok_or_else(|| {
                    AttemptFailure::new(TaskError::permanent(format!(
                        "no provider configured for {}",
                        kind
                    )))
                })?;

                // Quota waits are not part of the call deadline
                provider.ready().await;
                let started = Instant::now();
                let generated =
                    match tokio::time::timeout(self.timeout, provider.generate(&self.request)).await
                    {
                        Ok(Ok(generated)) => generated,
                        Ok(Err(e)) => return Err(AttemptFailure::new(e.to_task_error())),
                        Err(_) => {
                            return Err(AttemptFailure::new(TaskError::timeout(format!(
                                "{} call exceeded {:?}",
                                kind, self.timeout
                            ))))
                        }
                    };
                (generated, Some(started.elapsed()))
            }
        };

        let duration_secs = generated.duration_secs;
        match self
            .store
            .put(&self.key, content_kind, Some(task_id), &generated.bytes)
            .await
        {
            Ok(artifact) => Ok(AttemptSuccess {
                artifact,
                reused: false,
                provider_latency,
                duration_secs,
            }),
            Err(StorageError::AlreadyExists(_)) => {
                match self.store.existing(&self.key, content_kind, Some(task_id)).await {
                    Ok(Some(artifact)) => Ok(AttemptSuccess {
                        artifact,
                        reused: false,
                        provider_latency,
                        duration_secs,
                    }),
                    Ok(None) => Err(AttemptFailure {
                        error: TaskError::transient(format!("{} vanished after write", self.key)),
                        unsaved: Some(generated),
                    }),
                    Err(e) => Err(AttemptFailure {
                        error: TaskError::transient(e.to_string()),
                        unsaved: Some(generated),
                    }),
                }
            }
            Err(e) => Err(AttemptFailure {
                error: TaskError::transient(format!("failed to persist artifact: {}", e)),
                unsaved: Some(generated),
            }),
        }
    }
}

/// Drives one run's job graph to completion or stop.
pub struct Scheduler {
    run_id: RunId,
    request: PipelineRequest,
    scenes: HashMap<u32, SceneSpec>,
    providers: ProviderSet,
    store: Arc<dyn ArtifactStore>,
    journal: Arc<dyn RunJournal>,
    limits: SchedulerLimits,
    semaphores: BTreeMap<TaskKind, Arc<Semaphore>>,
    cancel_rx: watch::Receiver<bool>,
    status_tx: Arc<watch::Sender<RunStatusView>>,
    logger: RunLogger,
}

/// Mutable state owned by the control loop.
struct LoopState {
    run: PipelineRun,
    graph: JobGraph,
    queues: BTreeMap<TaskKind, VecDeque<TaskId>>,
    unsaved: HashMap<TaskId, GeneratedArtifact>,
    stop: Option<StopReason>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run: &PipelineRun,
        providers: ProviderSet,
        store: Arc<dyn ArtifactStore>,
        journal: Arc<dyn RunJournal>,
        limits: SchedulerLimits,
        cancel_rx: watch::Receiver<bool>,
        status_tx: Arc<watch::Sender<RunStatusView>>,
    ) -> Self {
        let semaphores = TaskKind::ALL
            .iter()
            .map(|&kind| {
                let permits = limits.concurrency.get(kind).max(1);
                (kind, Arc::new(Semaphore::new(permits)))
            })
            .collect();

        Self {
            run_id: run.id.clone(),
            request: run.request.clone(),
            scenes: run.scenes.iter().map(|s| (s.index, s.clone())).collect(),
            providers,
            store,
            journal,
            limits,
            semaphores,
            cancel_rx,
            status_tx,
            logger: RunLogger::new(&run.id, "scheduling"),
        }
    }

    /// Run the control loop until the graph drains or the run stops.
    pub async fn run(mut self, run: PipelineRun, graph: JobGraph) -> ScheduleOutcome {
        let mut state = LoopState {
            run,
            graph,
            queues: TaskKind::ALL.iter().map(|&k| (k, VecDeque::new())).collect(),
            unsaved: HashMap::new(),
            stop: None,
        };
        let mut attempts: JoinSet<AttemptReport> = JoinSet::new();
        let mut timers: JoinSet<TaskId> = JoinSet::new();
        let mut cancel_open = true;
        let deadline = self.limits.deadline.unwrap_or_else(far_future);

        state.graph.ready_tasks();
        for id in state.graph.ready_ids() {
            self.enqueue(&mut state, id);
        }
        self.logger.log_start(&format!(
            "{} tasks, {} ready",
            state.graph.len(),
            state.queues.values().map(VecDeque::len).sum::<usize>()
        ));
        self.publish(&state);

        loop {
            if state.stop.is_none() {
                if let Some(reason) = self.stop_requested() {
                    self.begin_stop(&mut state, reason, &mut timers);
                } else {
                    self.dispatch(&mut state, &mut attempts).await;
                }
            }

            let idle = attempts.is_empty() && (state.stop.is_some() || timers.is_empty());
            if idle {
                break;
            }

            tokio::select! {
                Some(joined) = attempts.join_next() => match joined {
                    Ok(report) => self.on_report(&mut state, report, &mut timers).await,
                    Err(e) => self.logger.log_error(&format!("attempt task aborted: {}", e)),
                },
                Some(joined) = timers.join_next(), if state.stop.is_none() => {
                    if let Ok(task_id) = joined {
                        self.enqueue(&mut state, task_id);
                    }
                }
                changed = self.cancel_rx.changed(), if cancel_open && state.stop.is_none() => {
                    if changed.is_err() {
                        // Sender dropped; no cancellation can arrive any more.
                        cancel_open = false;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if self.limits.deadline.is_some() && state.stop.is_none() => {
                    self.begin_stop(&mut state, StopReason::TimedOut, &mut timers);
                }
                else => break,
            }
        }

        if state.stop.is_none() && !state.graph.is_drained() {
            self.logger
                .log_warning("scheduler went idle with undrained tasks");
        }
        for kind in TaskKind::ALL {
            metrics::set_in_flight(kind, 0);
        }

        let counts = state.graph.counts();
        self.logger.log_completion(&format!(
            "succeeded={} failed={} abandoned={} stop={:?}",
            counts.succeeded, counts.failed, counts.abandoned, state.stop
        ));

        ScheduleOutcome {
            run: state.run,
            graph: state.graph,
            stop: state.stop,
        }
    }

    fn stop_requested(&self) -> Option<StopReason> {
        if *self.cancel_rx.borrow() {
            Some(StopReason::Cancelled)
        } else if self
            .limits
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            Some(StopReason::TimedOut)
        } else {
            None
        }
    }

    fn begin_stop(&self, state: &mut LoopState, reason: StopReason, timers: &mut JoinSet<TaskId>) {
        timers.abort_all();
        self.halt(state, reason);
    }

    /// Stop dispatching. Timers left running are never polled again and die
    /// with the loop.
    fn halt(&self, state: &mut LoopState, reason: StopReason) {
        state.stop = Some(reason);
        for queue in state.queues.values_mut() {
            queue.clear();
        }
        self.logger.log_warning(&format!(
            "stopping ({:?}); waiting for {} in-flight calls",
            reason,
            state.graph.counts().in_flight
        ));
    }

    fn journal_lost(&self, state: &mut LoopState, error: JournalError) {
        self.logger
            .log_error(&format!("journal append failed, stopping run: {}", error));
        self.halt(state, StopReason::JournalUnavailable);
    }

    fn enqueue(&self, state: &mut LoopState, task_id: TaskId) {
        if let Some(task) = state.graph.task(&task_id) {
            if let Some(queue) = state.queues.get_mut(&task.kind) {
                queue.push_back(task_id);
            }
        }
    }

    /// Start attempts for queued tasks while their kind has budget.
    async fn dispatch(&self, state: &mut LoopState, attempts: &mut JoinSet<AttemptReport>) {
        for kind in TaskKind::ALL {
            let Some(semaphore) = self.semaphores.get(&kind) else {
                continue;
            };

            loop {
                // Checked at every dispatch point
                if self.stop_requested().is_some() {
                    return;
                }
                let Some(queue) = state.queues.get_mut(&kind) else {
                    break;
                };
                if queue.is_empty() {
                    break;
                }
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(task_id) = queue.pop_front() else {
                    break;
                };

                let Some(mut request) = self.generation_request(&state.graph, &task_id) else {
                    self.logger
                        .log_task_warning(&task_id, "task has no scene; not dispatched");
                    continue;
                };
                let attempt = match state.graph.mark_dispatched(&task_id) {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        self.logger.log_task_warning(&task_id, &e.to_string());
                        continue;
                    }
                };
                request.attempt = attempt;
                let scene_index = request.scene.index;

                let dispatched = RunEvent::TaskDispatched {
                    task_id: task_id.clone(),
                    attempt,
                };
                if let Err(e) = self.journal(dispatched).await {
                    // Not durable, so the dispatch is undone
                    if let Err(rollback) = state.graph.requeue_interrupted(&task_id) {
                        self.logger.log_task_warning(&task_id, &rollback.to_string());
                    }
                    self.journal_lost(state, e);
                    self.publish(state);
                    return;
                }
                metrics::record_dispatch(kind);
                tracing::debug!(
                    run_id = %self.run_id,
                    task_id = %task_id,
                    kind = %kind,
                    scene_index,
                    attempt,
                    "Dispatching task"
                );

                let key = match kind {
                    TaskKind::Outline => outline_key(&self.run_id),
                    _ => scene_key(&self.run_id, scene_index, kind),
                };
                let job = Attempt {
                    key,
                    provider: self.providers.get(kind),
                    store: Arc::clone(&self.store),
                    timeout: self.limits.call_timeouts.get(kind),
                    unsaved: state.unsaved.remove(&task_id),
                    request,
                };

                attempts.spawn(async move {
                    let result = match AssertUnwindSafe(job.execute()).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(AttemptFailure::new(TaskError::permanent(
                            "provider attempt panicked",
                        ))),
                    };
                    drop(permit);
                    AttemptReport {
                        task_id,
                        kind,
                        attempt,
                        result,
                    }
                });

                self.record_in_flight(kind);
            }
        }
        self.publish(state);
    }

    /// Request for the next attempt of a task; `attempt` is filled in at
    /// dispatch.
    fn generation_request(&self, graph: &JobGraph, task_id: &TaskId) -> Option<GenerationRequest> {
        let task = graph.task(task_id)?;
        let scene = self.scenes.get(&task.scene_index)?.clone();
        let inputs = task
            .dependencies
            .iter()
            .filter_map(|dep| graph.task(dep).and_then(|t| t.artifact.clone()))
            .collect();
        let scenes = match task.kind {
            TaskKind::Outline => self.request.ordered_scenes(),
            _ => Vec::new(),
        };

        Some(GenerationRequest {
            run_id: self.run_id.clone(),
            task_id: task_id.clone(),
            kind: task.kind,
            attempt: 0,
            scene,
            scenes,
            topic: self.request.topic.clone(),
            style: self.request.style.clone(),
            language: self.request.language.clone(),
            target_duration_secs: self.request.target_duration_secs,
            narrator_voice_style: self.request.narrator_voice_style.clone(),
            inputs,
        })
    }

    async fn on_report(
        &self,
        state: &mut LoopState,
        report: AttemptReport,
        timers: &mut JoinSet<TaskId>,
    ) {
        let kind = report.kind;
        self.apply_report(state, report, timers).await;
        self.record_in_flight(kind);
        self.publish(state);
    }

    async fn apply_report(
        &self,
        state: &mut LoopState,
        report: AttemptReport,
        timers: &mut JoinSet<TaskId>,
    ) {
        let AttemptReport {
            task_id,
            kind,
            attempt,
            result,
        } = report;

        if state.stop == Some(StopReason::JournalUnavailable) {
            self.logger.log_task_warning(
                &task_id,
                &format!("attempt {} finished after the journal failed; left in flight", attempt),
            );
            return;
        }
        match state.graph.task(&task_id).map(|t| t.state) {
            Some(TaskState::InFlight) => {}
            other => {
                self.logger.log_task_warning(
                    &task_id,
                    &format!("report for attempt {} in state {:?} ignored", attempt, other),
                );
                return;
            }
        }

        match result {
            Ok(success) => {
                let event = RunEvent::TaskSucceeded {
                    task_id: task_id.clone(),
                    artifact: success.artifact.clone(),
                };
                if let Err(e) = self.journal(event).await {
                    self.journal_lost(state, e);
                    return;
                }
                if let Err(e) = state
                    .graph
                    .mark(&task_id, TaskOutcome::Succeeded(success.artifact.clone()))
                {
                    self.logger.log_task_warning(&task_id, &e.to_string());
                    return;
                }
                if success.reused {
                    metrics::record_artifact_reused(kind);
                }
                if let Some(latency) = success.provider_latency {
                    metrics::record_provider_latency(kind, latency.as_secs_f64());
                }
                metrics::record_task_outcome(kind, "succeeded");
                let media = success
                    .duration_secs
                    .map(|secs| format!(", {:.2}s", secs))
                    .unwrap_or_default();
                self.logger.log_task(
                    &task_id,
                    &format!(
                        "succeeded on attempt {} ({} bytes{})",
                        attempt, success.artifact.size, media
                    ),
                );

                if state.stop.is_none() {
                    for id in state.graph.ready_tasks() {
                        self.enqueue(state, id);
                    }
                }
            }
            Err(failure) => {
                let error = failure.error;
                if let Some(unsaved) = failure.unsaved {
                    state.unsaved.insert(task_id.clone(), unsaved);
                }

                match self.limits.retry.decide(attempt, error.class) {
                    RetryDecision::RetryAfter(delay) => {
                        let stopping = state.stop.is_some();
                        let event = if stopping {
                            RunEvent::TaskRequeued {
                                task_id: task_id.clone(),
                                error: error.clone(),
                            }
                        } else {
                            RunEvent::TaskRetryScheduled {
                                task_id: task_id.clone(),
                                attempt,
                                delay_ms: delay.as_millis() as u64,
                                error: error.clone(),
                            }
                        };
                        if let Err(e) = self.journal(event).await {
                            self.journal_lost(state, e);
                            return;
                        }
                        if let Err(e) = state.graph.mark_retrying(&task_id, error.clone()) {
                            self.logger.log_task_warning(&task_id, &e.to_string());
                            return;
                        }
                        if stopping {
                            self.logger.log_task_warning(
                                &task_id,
                                &format!("attempt {} failed while stopping: {}", attempt, error),
                            );
                        } else {
                            self.logger.log_task_warning(
                                &task_id,
                                &format!(
                                    "attempt {} failed, retrying in {:?}: {}",
                                    attempt, delay, error
                                ),
                            );
                            metrics::record_task_retry(kind);
                            timers.spawn(async move {
                                tokio::time::sleep(delay).await;
                                task_id
                            });
                        }
                    }
                    RetryDecision::GiveUp => {
                        state.unsaved.remove(&task_id);
                        let event = RunEvent::TaskFailed {
                            task_id: task_id.clone(),
                            error: error.clone(),
                        };
                        if let Err(e) = self.journal(event).await {
                            self.journal_lost(state, e);
                            return;
                        }
                        let abandoned = match state
                            .graph
                            .mark(&task_id, TaskOutcome::Failed(error.clone()))
                        {
                            Ok(abandoned) => abandoned,
                            Err(e) => {
                                self.logger.log_task_warning(&task_id, &e.to_string());
                                return;
                            }
                        };
                        metrics::record_task_outcome(kind, "failed");
                        self.logger.log_task_warning(
                            &task_id,
                            &format!(
                                "failed after {} attempts: {}; abandoning {} downstream tasks",
                                attempt,
                                error,
                                abandoned.len()
                            ),
                        );
                        // Replaying task_failed abandons these as well
                        for id in abandoned {
                            if let Some(task) = state.graph.task(&id) {
                                metrics::record_task_outcome(task.kind, "abandoned");
                            }
                            let event = RunEvent::TaskAbandoned {
                                task_id: id,
                                upstream: task_id.clone(),
                            };
                            if let Err(e) = self.journal(event).await {
                                self.journal_lost(state, e);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn journal(&self, event: RunEvent) -> JournalResult<()> {
        append_with_retry(
            self.journal.as_ref(),
            &self.run_id,
            event,
            &self.limits.io_retry,
        )
        .await
    }

    fn record_in_flight(&self, kind: TaskKind) {
        if let Some(semaphore) = self.semaphores.get(&kind) {
            let budget = self.limits.concurrency.get(kind).max(1);
            metrics::set_in_flight(kind, budget.saturating_sub(semaphore.available_permits()));
        }
    }

    fn publish(&self, state: &LoopState) {
        self.status_tx
            .send_replace(RunStatusView::project(&state.run, state.graph.tasks()));
    }
}

fn far_future() -> Instant {
    // Roughly 30 years; Instant + Duration::MAX would overflow.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}
