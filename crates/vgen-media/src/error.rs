//! Media errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

/// Failure while probing, muxing or concatenating scene media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolMissing(&'static str),

    #[error("{tool} failed ({context}), exit code {exit_code:?}")]
    ToolFailed {
        tool: &'static str,
        context: String,
        exit_code: Option<i32>,
        /// Last diagnostic lines the tool printed
        stderr_tail: Option<String>,
    },

    /// Input that cannot go into a scene: missing file, missing stream,
    /// zero duration.
    #[error("unusable media {path}: {reason}")]
    Unusable { path: PathBuf, reason: String },

    #[error("no segments to concatenate")]
    EmptyConcat,

    #[error("media operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unreadable probe output: {0}")]
    ProbeOutput(#[from] serde_json::Error),
}

impl MediaError {
    pub fn tool_failed(
        tool: &'static str,
        context: impl Into<String>,
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    ) -> Self {
        Self::ToolFailed {
            tool,
            context: context.into(),
            exit_code,
            stderr_tail,
        }
    }

    pub fn unusable(path: &Path, reason: impl Into<String>) -> Self {
        Self::Unusable {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}
