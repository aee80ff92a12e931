//! Storage key layout.
//!
//! ```text
//! runs/{run_id}/outline.json
//! runs/{run_id}/scenes/{index:03}/{kind}.{ext}
//! runs/{run_id}/output/final-{fingerprint}.mp4
//! ```

use vgen_models::{ContentKind, RunId, TaskKind};

use crate::error::{StorageError, StorageResult};

/// Prefix holding every object of a run.
pub fn run_prefix(run_id: &RunId) -> String {
    format!("runs/{}/", run_id)
}

/// Key of the run-wide outline.
pub fn outline_key(run_id: &RunId) -> String {
    format!(
        "runs/{}/outline.{}",
        run_id,
        TaskKind::Outline.output_kind().extension()
    )
}

/// Key of the artifact produced by the `kind` task of a scene.
pub fn scene_key(run_id: &RunId, scene_index: u32, kind: TaskKind) -> String {
    format!(
        "runs/{}/scenes/{:03}/{}.{}",
        run_id,
        scene_index,
        kind.as_str(),
        kind.output_kind().extension()
    )
}

/// Key of an assembled video, addressed by the fingerprint of its inputs.
pub fn final_key(run_id: &RunId, fingerprint: &str) -> String {
    format!(
        "runs/{}/output/final-{}.{}",
        run_id,
        fingerprint,
        ContentKind::FinalVideo.extension()
    )
}

/// Reject keys that could escape a directory root or are otherwise unusable.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > 1024 {
        return Err(StorageError::invalid_key(key, "length out of range"));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::invalid_key(key, "absolute path or forbidden character"));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::invalid_key(key, "empty or relative segment"));
    }
    Ok(())
}
