//! Provider request/response types.

use serde::{Deserialize, Serialize};
use vgen_models::{ArtifactRef, RunId, SceneSpec, TaskId, TaskKind};

/// Everything a provider needs to generate one task's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub kind: TaskKind,
    /// 1-based attempt number
    pub attempt: u32,
    pub scene: SceneSpec,
    /// Every scene of the run; only filled for outline tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenes: Vec<SceneSpec>,
    pub topic: String,
    pub style: String,
    pub language: String,
    /// Requested length of the whole video in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_duration_secs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrator_voice_style: Option<String>,
    /// Artifacts of the task's succeeded dependencies
    pub inputs: Vec<ArtifactRef>,
}

impl GenerationRequest {
    /// Upstream artifact produced by a `kind` task, if present.
    pub fn input(&self, kind: TaskKind) -> Option<&ArtifactRef> {
        let wanted = kind.output_kind();
        self.inputs.iter().find(|a| a.kind == wanted)
    }
}

/// Bytes produced by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifact {
    pub bytes: Vec<u8>,
    /// Media duration, when the provider reports one
    pub duration_secs: Option<f64>,
}

impl GeneratedArtifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            duration_secs: None,
        }
    }
}
