//! Pipeline requests and scene specs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Default narration language.
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// One narrative unit of the final video.
///
/// `index` defines the position in the final cut. It is never inferred from
/// completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct SceneSpec {
    pub index: u32,

    #[validate(length(min = 1, message = "narrative must not be empty"))]
    pub narrative: String,

    /// Requested scene length in seconds
    #[validate(range(min = 0.5, max = 120.0))]
    pub duration_hint_secs: f64,
}

impl SceneSpec {
    pub fn new(index: u32, narrative: impl Into<String>, duration_hint_secs: f64) -> Self {
        Self {
            index,
            narrative: narrative.into(),
            duration_hint_secs,
        }
    }
}

/// Request accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct PipelineRequest {
    #[validate(length(min = 1, message = "topic must not be empty"))]
    pub topic: String,

    /// Visual style hint passed through to providers
    #[serde(default)]
    pub style: String,

    /// Target total length in seconds
    #[serde(default)]
    pub target_duration_secs: Option<u32>,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub narrator_voice_style: Option<String>,

    /// Plan a run-wide outline before any script is written
    #[serde(default)]
    pub outline: bool,

    #[validate(length(min = 1, message = "at least one scene is required"), nested)]
    pub scenes: Vec<SceneSpec>,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// Request rejected before a run is created.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

impl PipelineRequest {
    pub fn new(topic: impl Into<String>, scenes: Vec<SceneSpec>) -> Self {
        Self {
            topic: topic.into(),
            style: String::new(),
            target_duration_secs: None,
            language: default_language(),
            narrator_voice_style: None,
            outline: false,
            scenes,
        }
    }

    pub fn with_outline(mut self) -> Self {
        self.outline = true;
        self
    }

    /// Field-level validation. Scene index uniqueness is checked at graph
    /// construction.
    pub fn check(&self) -> Result<(), RequestError> {
        self.validate()?;
        Ok(())
    }

    /// Scenes sorted by index.
    pub fn ordered_scenes(&self) -> Vec<SceneSpec> {
        let mut scenes = self.scenes.clone();
        scenes.sort_by_key(|s| s.index);
        scenes
    }
}
