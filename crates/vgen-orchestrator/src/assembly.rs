//! Final assembly of completed scenes.
//!
//! Planning is pure: it reads the drained graph and picks, by scene index,
//! every scene whose four tasks succeeded. Incomplete scenes become explicit
//! gaps. The engine then downloads each bundle, muxes narration onto the
//! clip, concatenates in index order and stores the result under a key
//! derived from the inputs, so re-assembling the same set is a no-op.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use vgen_media::{Composer, SceneMux};
use vgen_models::{ArtifactRef, ContentKind, RunId, SceneGap, TaskKind, TaskState};
use vgen_storage::{final_key, ArtifactStore, StorageError};

use crate::error::AssemblyError;
use crate::graph::JobGraph;
use crate::logging::RunLogger;
use crate::metrics;
use crate::retry::{retry_async, RetryPolicy};

/// Artifacts of one complete scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneBundle {
    pub scene_index: u32,
    pub clip: ArtifactRef,
    pub voice: ArtifactRef,
}

/// Which scenes go into the final video, and which are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyPlan {
    /// Sorted by scene index
    pub bundles: Vec<SceneBundle>,
    /// Sorted by scene index
    pub gaps: Vec<SceneGap>,
}

impl AssemblyPlan {
    pub fn scene_indices(&self) -> Vec<u32> {
        self.bundles.iter().map(|b| b.scene_index).collect()
    }

    /// Content fingerprint of the inputs and the encoding profile.
    pub fn fingerprint(&self, profile: &str) -> String {
        let mut hasher = Sha256::new();
        for bundle in &self.bundles {
            hasher.update(
                format!(
                    "{}|{}|{}|{}|{}\n",
                    bundle.scene_index,
                    bundle.clip.key,
                    bundle.clip.size,
                    bundle.voice.key,
                    bundle.voice.size
                )
                .as_bytes(),
            );
        }
        hasher.update(profile.as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
    }
}

/// Plan assembly from a graph. Only Succeeded tasks contribute artifacts.
pub fn plan(graph: &JobGraph) -> AssemblyPlan {
    let mut plan = AssemblyPlan::default();

    for scene_index in graph.scene_indices() {
        let succeeded = |kind| {
            graph
                .scene_task(scene_index, kind)
                .filter(|t| t.state == TaskState::Succeeded)
                .and_then(|t| t.artifact.clone())
        };

        let missing: Vec<TaskKind> = TaskKind::SCENE
            .into_iter()
            .filter(|&kind| succeeded(kind).is_none())
            .collect();

        match (succeeded(TaskKind::Clip), succeeded(TaskKind::Voice)) {
            (Some(clip), Some(voice)) if missing.is_empty() => plan.bundles.push(SceneBundle {
                scene_index,
                clip,
                voice,
            }),
            _ => plan.gaps.push(SceneGap {
                scene_index,
                reason: gap_reason(graph, scene_index),
                missing,
            }),
        }
    }

    plan
}

/// Most specific reason a scene is incomplete: a failed task first, then an
/// abandoned one, then whatever never finished.
fn gap_reason(graph: &JobGraph, scene_index: u32) -> String {
    let tasks: Vec<_> = TaskKind::SCENE
        .into_iter()
        .filter_map(|kind| graph.scene_task(scene_index, kind))
        .collect();

    if let Some(task) = tasks.iter().find(|t| t.state == TaskState::Failed) {
        let error = task
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return format!("{} failed: {}", task.kind, error);
    }
    if let Some(task) = tasks.iter().find(|t| t.state == TaskState::Abandoned) {
        return format!("{} abandoned", task.kind);
    }
    match tasks.iter().find(|t| t.state != TaskState::Succeeded) {
        Some(task) => format!("{} did not finish ({})", task.kind, task.state),
        None => "incomplete".to_string(),
    }
}

/// Composes completed scenes into the final video.
pub struct AssemblyEngine {
    store: Arc<dyn ArtifactStore>,
    composer: Arc<dyn Composer>,
    work_dir: PathBuf,
    io_retry: RetryPolicy,
}

impl AssemblyEngine {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        composer: Arc<dyn Composer>,
        work_dir: impl Into<PathBuf>,
        io_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            composer,
            work_dir: work_dir.into(),
            io_retry,
        }
    }

    /// Assemble the planned scenes, in index order, into one FinalVideo.
    ///
    /// Idempotent: the output key is derived from the inputs, and an
    /// existing output is returned as is.
    pub async fn assemble(
        &self,
        run_id: &RunId,
        plan: &AssemblyPlan,
    ) -> Result<ArtifactRef, AssemblyError> {
        if plan.bundles.is_empty() {
            return Err(AssemblyError::NothingToAssemble);
        }
        let logger = RunLogger::new(run_id, "assembly");
        let started = Instant::now();

        let key = final_key(run_id, &plan.fingerprint(&self.composer.profile()));
        let existing = retry_async(&self.io_retry, "head_final", StorageError::is_retryable, || {
            self.store.existing(&key, ContentKind::FinalVideo, None)
        })
        .await
        .map_err(AssemblyError::Upload)?;
        if let Some(artifact) = existing {
            logger.log_progress(&format!("reusing assembled output {}", artifact.key));
            return Ok(artifact);
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("assembly-{}-", run_id))
            .tempdir_in(&self.work_dir)?;

        logger.log_start(&format!(
            "{} scenes {:?}, {} gaps",
            plan.bundles.len(),
            plan.scene_indices(),
            plan.gaps.len()
        ));

        let mut segments = Vec::with_capacity(plan.bundles.len());
        for bundle in &plan.bundles {
            segments.push(self.render_scene(bundle, scratch.path()).await?);
        }

        let output = scratch.path().join("final.mp4");
        self.composer
            .concat(&segments, &output)
            .await
            .map_err(AssemblyError::Concat)?;

        let artifact = match retry_async(&self.io_retry, "upload_final", StorageError::is_retryable, || {
            self.store
                .upload_file(&output, &key, ContentKind::FinalVideo, None)
        })
        .await
        {
            Ok(artifact) => artifact,
            // A concurrent assembly of the same inputs won the write.
            Err(StorageError::AlreadyExists(_)) => self
                .store
                .existing(&key, ContentKind::FinalVideo, None)
                .await
                .map_err(AssemblyError::Upload)?
                .ok_or_else(|| AssemblyError::Upload(StorageError::not_found(&key)))?,
            Err(e) => return Err(AssemblyError::Upload(e)),
        };

        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_assembly(elapsed);
        logger.log_completion(&format!(
            "{} ({} bytes) in {:.1}s",
            artifact.key, artifact.size, elapsed
        ));
        Ok(artifact)
    }

    async fn render_scene(
        &self,
        bundle: &SceneBundle,
        dir: &Path,
    ) -> Result<PathBuf, AssemblyError> {
        let index = bundle.scene_index;
        let video = dir.join(format!(
            "scene-{:03}-clip.{}",
            index,
            ContentKind::Video.extension()
        ));
        let narration = dir.join(format!(
            "scene-{:03}-voice.{}",
            index,
            ContentKind::Audio.extension()
        ));

        let fetch = |artifact: &ArtifactRef, path: &Path| {
            let artifact = artifact.clone();
            let path = path.to_path_buf();
            async move {
                retry_async(
                    &self.io_retry,
                    "download_artifact",
                    StorageError::is_retryable,
                    || self.store.download_to(&artifact, &path),
                )
                .await
                .map_err(|source| AssemblyError::Fetch {
                    scene_index: index,
                    source,
                })
            }
        };
        tokio::try_join!(fetch(&bundle.clip, &video), fetch(&bundle.voice, &narration))?;

        let render = self
            .composer
            .mux_scene(&SceneMux {
                scene_index: index,
                video,
                narration,
                output: dir.join(format!("scene-{:03}.mp4", index)),
            })
            .await
            .map_err(|source| AssemblyError::Mux {
                scene_index: index,
                source,
            })?;

        tracing::debug!(
            scene_index = index,
            output_secs = render.reconciliation.output_secs,
            video_pad_secs = render.reconciliation.video_pad_secs,
            audio_cut_secs = render.reconciliation.audio_cut_secs,
            "Scene muxed"
        );
        Ok(render.output)
    }
}
