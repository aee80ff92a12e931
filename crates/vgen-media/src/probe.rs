//! Stream inspection with ffprobe, plus decoded-content digests.

use std::ffi::OsString;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::{capture, check_ffmpeg, check_ffprobe};
use crate::error::{MediaError, MediaResult};

/// What a scene input actually contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Container duration, 0 when ffprobe reports none
    pub duration_secs: f64,
    pub video: Option<VideoStream>,
    pub has_audio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

#[derive(Deserialize)]
struct ProbeReport {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    avg_frame_rate: Option<String>,
}

/// Inspect `path`. Files with neither audio nor video are rejected.
pub async fn probe_media(path: impl AsRef<Path>) -> MediaResult<MediaInfo> {
    let path = path.as_ref();
    if !tokio::fs::try_exists(path).await? {
        return Err(MediaError::unusable(path, "file does not exist"));
    }
    check_ffprobe()?;

    let mut args: Vec<OsString> =
        ["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"]
            .into_iter()
            .map(OsString::from)
            .collect();
    args.push(path.as_os_str().to_owned());

    let stdout = capture("ffprobe", args, path).await?;
    parse_report(path, &stdout)
}

fn parse_report(path: &Path, json: &[u8]) -> MediaResult<MediaInfo> {
    let report: ProbeReport = serde_json::from_slice(json)?;

    let video = report
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .map(|s| VideoStream {
            width: s.width,
            height: s.height,
            fps: s.avg_frame_rate.as_deref().and_then(frame_rate),
        });
    let has_audio = report.streams.iter().any(|s| s.codec_type == "audio");

    if video.is_none() && !has_audio {
        return Err(MediaError::unusable(path, "no audio or video stream"));
    }

    let duration_secs = report
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        duration_secs,
        video,
        has_audio,
    })
}

/// MD5 over every decoded stream of `path`.
///
/// Independent of container muxing, so two renders of the same content
/// compare equal even when their bytes differ.
pub async fn decoded_md5(path: impl AsRef<Path>) -> MediaResult<String> {
    let path = path.as_ref();
    check_ffmpeg()?;

    let mut args: Vec<OsString> = vec!["-v".into(), "error".into(), "-i".into()];
    args.push(path.as_os_str().to_owned());
    args.extend(["-map", "0", "-f", "md5", "-"].map(OsString::from));

    let stdout = capture("ffmpeg", args, path).await?;
    String::from_utf8_lossy(&stdout)
        .trim()
        .strip_prefix("MD5=")
        .map(str::to_owned)
        .ok_or_else(|| MediaError::unusable(path, "md5 muxer printed no digest"))
}

/// `"30000/1001"` or `"25"` as frames per second. ffprobe reports `"0/0"`
/// for streams without a fixed rate.
fn frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let (num, den): (f64, f64) = (num.parse().ok()?, den.parse().ok()?);
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.parse().ok()?,
    };
    (fps > 0.0).then_some(fps)
}
