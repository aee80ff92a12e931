//! Artifact references.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::task::TaskId;

/// Kind of content stored under an artifact key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Script,
    Image,
    Video,
    Audio,
    FinalVideo,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Script => "script",
            ContentKind::Image => "image",
            ContentKind::Video => "video",
            ContentKind::Audio => "audio",
            ContentKind::FinalVideo => "final_video",
        }
    }

    /// MIME type used when uploading.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContentKind::Script => "application/json",
            ContentKind::Image => "image/png",
            ContentKind::Video | ContentKind::FinalVideo => "video/mp4",
            ContentKind::Audio => "audio/mpeg",
        }
    }

    /// File extension used in storage keys and scratch files.
    pub fn extension(&self) -> &'static str {
        match self {
            ContentKind::Script => "json",
            ContentKind::Image => "png",
            ContentKind::Video | ContentKind::FinalVideo => "mp4",
            ContentKind::Audio => "mp3",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to a write-once blob in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    /// Producing task; `None` for the assembled final video
    pub task_id: Option<TaskId>,
    /// Storage key
    pub key: String,
    pub kind: ContentKind,
    /// Size in bytes
    pub size: u64,
}

impl ArtifactRef {
    pub fn new(task_id: Option<TaskId>, key: impl Into<String>, kind: ContentKind, size: u64) -> Self {
        Self {
            task_id,
            key: key.into(),
            kind,
            size,
        }
    }
}
