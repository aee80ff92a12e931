//! Render settings for final assembly.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "ultrafast";
/// Default CRF (Constant Rate Factor)
pub const DEFAULT_CRF: u8 = 20;
/// Default audio bitrate
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";

/// Output frame rate every scene is normalized to
pub const DEFAULT_FPS: u32 = 24;
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_PIXEL_FORMAT: &str = "yuv420p";
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Gain applied to a clip's own soundtrack when narration is mixed over it
pub const DEFAULT_BACKGROUND_VOLUME: f64 = 0.3;
/// Gain applied to narration
pub const DEFAULT_NARRATION_VOLUME: f64 = 1.5;

/// How a scene's video and narration durations are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioPolicy {
    /// Hold the last video frame until narration ends; pad narration with
    /// silence when the video is longer. Never cuts narration.
    #[default]
    PadVideo,
    /// Cut narration at the end of the video.
    TruncateAudio,
}

impl AudioPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioPolicy::PadVideo => "pad_video",
            AudioPolicy::TruncateAudio => "truncate_audio",
        }
    }
}

impl fmt::Display for AudioPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AudioPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pad_video" | "pad" => Ok(AudioPolicy::PadVideo),
            "truncate_audio" | "truncate" => Ok(AudioPolicy::TruncateAudio),
            other => Err(format!("unknown audio policy: {}", other)),
        }
    }
}

/// Encoding parameters applied to every normalized scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenderSettings {
    #[serde(default = "default_video_codec")]
    pub codec: String,

    #[serde(default = "default_preset")]
    pub preset: String,

    /// Constant Rate Factor (quality, 0-51, lower is better)
    #[serde(default = "default_crf")]
    pub crf: u8,

    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_background_volume")]
    pub background_volume: f64,

    #[serde(default = "default_narration_volume")]
    pub narration_volume: f64,

    #[serde(default)]
    pub audio_policy: AudioPolicy,
}

fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}
fn default_crf() -> u8 {
    DEFAULT_CRF
}
fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_audio_bitrate() -> String {
    DEFAULT_AUDIO_BITRATE.to_string()
}
fn default_fps() -> u32 {
    DEFAULT_FPS
}
fn default_width() -> u32 {
    DEFAULT_WIDTH
}
fn default_height() -> u32 {
    DEFAULT_HEIGHT
}
fn default_pixel_format() -> String {
    DEFAULT_PIXEL_FORMAT.to_string()
}
fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}
fn default_background_volume() -> f64 {
    DEFAULT_BACKGROUND_VOLUME
}
fn default_narration_volume() -> f64 {
    DEFAULT_NARRATION_VOLUME
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            codec: default_video_codec(),
            preset: default_preset(),
            crf: DEFAULT_CRF,
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
            fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pixel_format: default_pixel_format(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            background_volume: DEFAULT_BACKGROUND_VOLUME,
            narration_volume: DEFAULT_NARRATION_VOLUME,
            audio_policy: AudioPolicy::default(),
        }
    }
}

impl RenderSettings {
    pub fn with_policy(mut self, policy: AudioPolicy) -> Self {
        self.audio_policy = policy;
        self
    }

    /// Encoder arguments for a normalized scene.
    ///
    /// Single-threaded with bitexact flags so identical inputs encode
    /// identically on the same build.
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-c:v".to_string(),
            self.codec.clone(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-threads".to_string(),
            "1".to_string(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            self.audio_bitrate.clone(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-fflags".to_string(),
            "+bitexact".to_string(),
            "-flags:v".to_string(),
            "+bitexact".to_string(),
            "-flags:a".to_string(),
            "+bitexact".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RenderSettings::default();
        assert_eq!(settings.codec, "libx264");
        assert_eq!(settings.fps, 24);
        assert_eq!(settings.audio_policy, AudioPolicy::PadVideo);
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = RenderSettings::default().to_ffmpeg_args();
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"-crf".to_string()));
        assert!(args.contains(&"+bitexact".to_string()));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("pad_video".parse::<AudioPolicy>().unwrap(), AudioPolicy::PadVideo);
        assert_eq!(
            "TRUNCATE_AUDIO".parse::<AudioPolicy>().unwrap(),
            AudioPolicy::TruncateAudio
        );
        assert!("stretch".parse::<AudioPolicy>().is_err());
    }
}
