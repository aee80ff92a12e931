//! Shared fixtures for orchestrator scenario tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use vgen_media::{Composer, MediaError, MediaResult, Reconciliation, SceneMux, SceneRender};
use vgen_models::{ContentKind, PipelineRequest, RunId, SceneSpec, TaskId, TaskKind};
use vgen_orchestrator::{
    JournalError, JournalRecord, MemoryJournal, Orchestrator, OrchestratorConfig, PerKind,
    RetryPolicy, RunEvent, RunJournal,
};
use vgen_providers::{
    GeneratedArtifact, GenerationProvider, GenerationRequest, ProviderError, ProviderResult,
    ProviderSet,
};
use vgen_storage::{ArtifactStore, MemoryStore, StorageError, StorageOp, StorageResult};

/// What one scripted provider call does.
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    Transient,
    Permanent,
    /// Never returns
    Hang,
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: TaskId,
    pub attempt: u32,
    pub at: Instant,
    pub request: GenerationRequest,
}

/// Provider whose outcome per task is scripted up front. Unscripted calls
/// succeed.
pub struct ScriptedProvider {
    kind: TaskKind,
    delay: Duration,
    quota_wait: Duration,
    steps: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
            quota_wait: Duration::ZERO,
            steps: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Time `ready` takes before every call, as a client-side rate limit would.
    pub fn with_quota_wait(mut self, wait: Duration) -> Self {
        self.quota_wait = wait;
        self
    }

    /// Queue outcomes for the task of `scene_index`. The outline ignores
    /// the index.
    pub fn script(&self, scene_index: u32, steps: impl IntoIterator<Item = Step>) {
        let id = match self.kind {
            TaskKind::Outline => TaskId::outline(),
            kind => TaskId::for_scene(scene_index, kind),
        };
        self.steps
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, scene_index: u32) -> Vec<Call> {
        let id = match self.kind {
            TaskKind::Outline => TaskId::outline(),
            kind => TaskId::for_scene(scene_index, kind),
        };
        self.calls().into_iter().filter(|c| c.task_id == id).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn ready(&self) {
        if !self.quota_wait.is_zero() {
            tokio::time::sleep(self.quota_wait).await;
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GeneratedArtifact> {
        assert_eq!(request.kind, self.kind);
        self.calls.lock().unwrap().push(Call {
            task_id: request.task_id.clone(),
            attempt: request.attempt,
            at: Instant::now(),
            request: request.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self
            .steps
            .lock()
            .unwrap()
            .get_mut(&request.task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok);

        match step {
            Step::Ok => Ok(GeneratedArtifact::new(
                format!("{}#{}", request.task_id, request.attempt).into_bytes(),
            )),
            Step::Transient => Err(ProviderError::transient("503 upstream busy")),
            Step::Permanent => Err(ProviderError::permanent("content policy rejection")),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// One scripted provider per task kind.
pub struct Providers {
    pub outline: Arc<ScriptedProvider>,
    pub script: Arc<ScriptedProvider>,
    pub image: Arc<ScriptedProvider>,
    pub clip: Arc<ScriptedProvider>,
    pub voice: Arc<ScriptedProvider>,
}

impl Providers {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::build(delay, Duration::ZERO)
    }

    pub fn with_quota_wait(wait: Duration) -> Self {
        Self::build(Duration::ZERO, wait)
    }

    fn build(delay: Duration, quota_wait: Duration) -> Self {
        let make = |kind| {
            Arc::new(
                ScriptedProvider::new(kind)
                    .with_delay(delay)
                    .with_quota_wait(quota_wait),
            )
        };
        Self {
            outline: make(TaskKind::Outline),
            script: make(TaskKind::Script),
            image: make(TaskKind::Image),
            clip: make(TaskKind::Clip),
            voice: make(TaskKind::Voice),
        }
    }

    pub fn get(&self, kind: TaskKind) -> &Arc<ScriptedProvider> {
        match kind {
            TaskKind::Outline => &self.outline,
            TaskKind::Script => &self.script,
            TaskKind::Image => &self.image,
            TaskKind::Clip => &self.clip,
            TaskKind::Voice => &self.voice,
        }
    }

    pub fn total_calls(&self) -> usize {
        TaskKind::ALL.iter().map(|&k| self.get(k).call_count()).sum()
    }

    pub fn set(&self) -> ProviderSet {
        TaskKind::ALL.iter().fold(ProviderSet::new(), |set, &kind| {
            set.with(kind, self.get(kind).clone() as Arc<dyn GenerationProvider>)
        })
    }
}

/// Composer that writes plain-text manifests instead of media, so tests
/// can check which scenes were assembled and in what order.
#[derive(Debug, Default)]
pub struct ManifestComposer {
    concats: AtomicUsize,
}

impl ManifestComposer {
    pub fn concat_count(&self) -> usize {
        self.concats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Composer for ManifestComposer {
    async fn mux_scene(&self, scene: &SceneMux) -> MediaResult<SceneRender> {
        let video = tokio::fs::read(&scene.video).await?;
        let narration = tokio::fs::read(&scene.narration).await?;
        let line = format!(
            "scene {} {} {}\n",
            scene.scene_index,
            String::from_utf8_lossy(&video),
            String::from_utf8_lossy(&narration)
        );
        tokio::fs::write(&scene.output, line).await?;
        Ok(SceneRender {
            scene_index: scene.scene_index,
            output: scene.output.clone(),
            reconciliation: Reconciliation {
                output_secs: 4.0,
                video_pad_secs: 0.0,
                audio_pad_secs: 0.0,
                audio_cut_secs: 0.0,
            },
        })
    }

    async fn concat(&self, segments: &[PathBuf], output: &Path) -> MediaResult<()> {
        self.concats.fetch_add(1, Ordering::SeqCst);
        let mut manifest = String::new();
        for segment in segments {
            manifest.push_str(&tokio::fs::read_to_string(segment).await?);
        }
        tokio::fs::write(output, manifest).await?;
        Ok(())
    }

    fn profile(&self) -> String {
        "manifest".to_string()
    }
}

/// Manifest composer whose mux of one scene always fails.
#[derive(Debug)]
pub struct FailingComposer {
    inner: ManifestComposer,
    scene_index: u32,
}

impl FailingComposer {
    pub fn on_scene(scene_index: u32) -> Self {
        Self {
            inner: ManifestComposer::default(),
            scene_index,
        }
    }

    pub fn concat_count(&self) -> usize {
        self.inner.concat_count()
    }
}

#[async_trait]
impl Composer for FailingComposer {
    async fn mux_scene(&self, scene: &SceneMux) -> MediaResult<SceneRender> {
        if scene.scene_index == self.scene_index {
            return Err(MediaError::tool_failed(
                "ffmpeg",
                format!("writing {}", scene.output.display()),
                Some(1),
                Some("Invalid data found when processing input".to_string()),
            ));
        }
        self.inner.mux_scene(scene).await
    }

    async fn concat(&self, segments: &[PathBuf], output: &Path) -> MediaResult<()> {
        self.inner.concat(segments, output).await
    }

    fn profile(&self) -> String {
        self.inner.profile()
    }
}

/// Journal whose next `n` appends of a given event fail with an I/O error.
/// Reads see exactly what was appended successfully.
pub struct FaultyJournal {
    inner: Arc<MemoryJournal>,
    failures: Mutex<Vec<(&'static str, u32)>>,
    rejected: AtomicUsize,
}

impl FaultyJournal {
    pub fn new(inner: Arc<MemoryJournal>) -> Self {
        Self {
            inner,
            failures: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn fail_appends(&self, event: &'static str, times: u32) {
        self.failures.lock().unwrap().push((event, times));
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunJournal for FaultyJournal {
    async fn append(&self, run_id: &RunId, event: RunEvent) -> Result<(), JournalError> {
        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures
                .iter_mut()
                .find(|(name, left)| *left > 0 && *name == event.name())
            {
                Some((_, left)) => {
                    *left -= 1;
                    true
                }
                None => false,
            }
        };
        if fail {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(JournalError::Io(std::io::Error::other("no space left on device")));
        }
        self.inner.append(run_id, event).await
    }

    async fn load(&self, run_id: &RunId) -> Result<Vec<JournalRecord>, JournalError> {
        self.inner.load(run_id).await
    }

    async fn runs(&self) -> Result<Vec<RunId>, JournalError> {
        self.inner.runs().await
    }
}

/// Scene indices listed in an assembled manifest, in order.
pub fn manifest_scenes(manifest: &[u8]) -> Vec<u32> {
    String::from_utf8_lossy(manifest)
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1)?.parse().ok())
        .collect()
}

/// Store whose first `n` puts to keys containing a pattern fail.
pub struct FlakyStore {
    inner: MemoryStore,
    failures: Mutex<Vec<(String, u32)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_puts(&self, pattern: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), times));
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl ArtifactStore for FlakyStore {
    async fn put(
        &self,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
        bytes: &[u8],
    ) -> StorageResult<vgen_models::ArtifactRef> {
        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures
                .iter_mut()
                .find(|(pattern, left)| *left > 0 && key.contains(pattern.as_str()))
            {
                Some((_, left)) => {
                    *left -= 1;
                    true
                }
                None => false,
            }
        };
        if fail {
            return Err(StorageError::backend(StorageOp::Put, key, "connection reset"));
        }
        self.inner.put(key, kind, task_id, bytes).await
    }

    async fn get(&self, artifact: &vgen_models::ArtifactRef) -> StorageResult<Vec<u8>> {
        self.inner.get(artifact).await
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list_keys(prefix).await
    }
}

/// Config with small, deterministic delays rooted in `work_dir`.
pub fn test_config(work_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        concurrency: PerKind::uniform(4),
        call_timeouts: PerKind::uniform(Duration::from_secs(30)),
        retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(8)),
        io_retry: RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(40)),
        run_timeout: None,
        work_dir: work_dir.to_path_buf(),
        journal_dir: work_dir.join("journal"),
        ..OrchestratorConfig::default()
    }
}

pub fn request(scenes: u32) -> PipelineRequest {
    PipelineRequest::new(
        "the life of a tide pool",
        (0..scenes)
            .map(|i| SceneSpec::new(i, format!("scene {}", i), 4.0))
            .collect(),
    )
}

/// Everything a scenario needs, wired to in-memory backends.
pub struct Harness {
    pub providers: Providers,
    pub store: Arc<dyn ArtifactStore>,
    pub journal: Arc<MemoryJournal>,
    pub composer: Arc<ManifestComposer>,
    pub work: tempfile::TempDir,
    pub config: OrchestratorConfig,
}

impl Harness {
    pub fn new(providers: Providers) -> Self {
        Self::with_store(providers, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(providers: Providers, store: Arc<dyn ArtifactStore>) -> Self {
        let work = tempfile::tempdir().unwrap();
        let config = test_config(work.path());
        Self {
            providers,
            store,
            journal: Arc::new(MemoryJournal::new()),
            composer: Arc::new(ManifestComposer::default()),
            work,
            config,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.journal.clone(), self.composer.clone())
    }

    /// Orchestrator over the harness providers and store with a different
    /// journal or composer.
    pub fn orchestrator_with(
        &self,
        journal: Arc<dyn RunJournal>,
        composer: Arc<dyn Composer>,
    ) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            self.providers.set(),
            Arc::clone(&self.store),
            journal,
            composer,
        )
        .unwrap()
    }
}
