//! FFmpeg CLI wrapper for final video assembly.
//!
//! This crate provides:
//! - ffmpeg argument lists with positional inputs
//! - A runner with a deadline and `-progress` reporting
//! - ffprobe stream inspection and decoded-content digests
//! - Scene muxing under a pinned duration reconciliation policy
//! - Ordered concatenation of normalized scenes

pub mod command;
pub mod compose;
pub mod error;
pub mod probe;
pub mod progress;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use compose::{
    concat_list, reconcile, scene_filter_graph, Composer, FfmpegComposer, Reconciliation,
    SceneMux, SceneRender,
};
pub use error::{MediaError, MediaResult};
pub use probe::{decoded_md5, probe_media, MediaInfo, VideoStream};
pub use progress::RenderProgress;
