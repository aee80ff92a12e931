//! Scene muxing and concatenation.
//!
//! Each scene is normalized to the configured frame rate, resolution, pixel
//! format and sample rate, so the concat demuxer can join segments with
//! stream copy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use vgen_models::{AudioPolicy, RenderSettings};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_media;

/// Durations shorter than this are treated as zero.
const EPSILON_SECS: f64 = 0.0005;

/// Inputs of one scene mux.
#[derive(Debug, Clone)]
pub struct SceneMux {
    pub scene_index: u32,
    pub video: PathBuf,
    pub narration: PathBuf,
    pub output: PathBuf,
}

/// A normalized scene segment.
#[derive(Debug, Clone)]
pub struct SceneRender {
    pub scene_index: u32,
    pub output: PathBuf,
    pub reconciliation: Reconciliation,
}

/// How video and narration durations were reconciled for one scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Length of the muxed scene
    pub output_secs: f64,
    /// Seconds of held last frame appended to the video
    pub video_pad_secs: f64,
    /// Seconds of silence appended to the narration
    pub audio_pad_secs: f64,
    /// Seconds of narration cut off
    pub audio_cut_secs: f64,
}

/// Reconcile a video of `video_secs` with narration of `audio_secs`.
pub fn reconcile(policy: AudioPolicy, video_secs: f64, audio_secs: f64) -> Reconciliation {
    let video_secs = video_secs.max(0.0);
    let audio_secs = audio_secs.max(0.0);

    let output_secs = match policy {
        AudioPolicy::PadVideo => video_secs.max(audio_secs),
        AudioPolicy::TruncateAudio => video_secs,
    };

    Reconciliation {
        output_secs,
        video_pad_secs: clamp_small(output_secs - video_secs),
        audio_pad_secs: clamp_small(output_secs - audio_secs),
        audio_cut_secs: clamp_small(audio_secs - output_secs),
    }
}

fn clamp_small(secs: f64) -> f64 {
    if secs < EPSILON_SECS {
        0.0
    } else {
        secs
    }
}

/// Filter graph for one scene. Input 0 is the clip, input 1 the narration.
///
/// Produces `[v]` and `[a]`, both exactly `output_secs` long. When the clip
/// has its own soundtrack it is mixed under the narration.
pub fn scene_filter_graph(
    settings: &RenderSettings,
    recon: &Reconciliation,
    clip_has_audio: bool,
) -> String {
    let out = recon.output_secs;
    let mut video = format!(
        "[0:v]fps={fps},scale={w}:{h}:force_original_aspect_ratio=decrease,\
         pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,format={pix}",
        fps = settings.fps,
        w = settings.width,
        h = settings.height,
        pix = settings.pixel_format,
    );
    if recon.video_pad_secs > 0.0 {
        video.push_str(&format!(
            ",tpad=stop_mode=clone:stop_duration={:.3}",
            recon.video_pad_secs
        ));
    }
    video.push_str(&format!(",trim=duration={:.3},setpts=PTS-STARTPTS[v]", out));

    let audio_chain = |input: &str, volume: f64, label: &str| {
        format!(
            "[{input}]aresample={sr},aformat=channel_layouts=stereo,volume={volume:.2},\
             apad=whole_dur={out:.3},atrim=end={out:.3},asetpts=PTS-STARTPTS[{label}]",
            sr = settings.sample_rate,
        )
    };

    if clip_has_audio {
        format!(
            "{video};{bg};{fg};[bg][fg]amix=inputs=2:duration=first[a]",
            bg = audio_chain("0:a", settings.background_volume, "bg"),
            fg = audio_chain("1:a", settings.narration_volume, "fg"),
        )
    } else {
        format!(
            "{video};{fg}",
            fg = audio_chain("1:a", settings.narration_volume, "a"),
        )
    }
}

/// Body of an ffmpeg concat demuxer list file.
pub fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// Media composition backend used by assembly.
#[async_trait]
pub trait Composer: Send + Sync {
    /// Normalize one scene and mux its narration.
    async fn mux_scene(&self, scene: &SceneMux) -> MediaResult<SceneRender>;

    /// Join normalized segments, in the given order, into `output`.
    async fn concat(&self, segments: &[PathBuf], output: &Path) -> MediaResult<()>;

    /// Stable description of the encoding profile. Part of the final
    /// artifact fingerprint, so a changed profile yields a new output key.
    fn profile(&self) -> String;
}

/// FFmpeg-backed composer.
#[derive(Debug, Clone)]
pub struct FfmpegComposer {
    settings: RenderSettings,
    runner: FfmpegRunner,
}

impl FfmpegComposer {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            runner: FfmpegRunner::new(),
        }
    }

    /// Kill any single ffmpeg invocation that runs past `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }
}

#[async_trait]
impl Composer for FfmpegComposer {
    async fn mux_scene(&self, scene: &SceneMux) -> MediaResult<SceneRender> {
        let clip = probe_media(&scene.video).await?;
        if !clip.has_video() {
            return Err(MediaError::unusable(&scene.video, "clip has no video stream"));
        }
        let narration = probe_media(&scene.narration).await?;
        if !narration.has_audio {
            return Err(MediaError::unusable(
                &scene.narration,
                "narration has no audio stream",
            ));
        }

        let recon = reconcile(
            self.settings.audio_policy,
            clip.duration_secs,
            narration.duration_secs,
        );
        if recon.output_secs <= 0.0 {
            return Err(MediaError::unusable(
                &scene.video,
                format!("scene {} has zero duration", scene.scene_index),
            ));
        }
        debug!(
            scene_index = scene.scene_index,
            video_secs = clip.duration_secs,
            narration_secs = narration.duration_secs,
            output_secs = recon.output_secs,
            policy = %self.settings.audio_policy,
            "Reconciled scene durations"
        );

        let cmd = FfmpegCommand::new(&scene.output)
            .input(&scene.video)
            .input(&scene.narration)
            .filter_complex(scene_filter_graph(&self.settings, &recon, clip.has_audio))
            .map("[v]")
            .map("[a]")
            .output_duration(recon.output_secs)
            .output_args(self.settings.to_ffmpeg_args());

        self.runner.run(&cmd).await?;

        Ok(SceneRender {
            scene_index: scene.scene_index,
            output: scene.output.clone(),
            reconciliation: recon,
        })
    }

    async fn concat(&self, segments: &[PathBuf], output: &Path) -> MediaResult<()> {
        if segments.is_empty() {
            return Err(MediaError::EmptyConcat);
        }

        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, concat_list(segments)).await?;

        let cmd = FfmpegCommand::new(output)
            .input_with_args(["-f", "concat", "-safe", "0"], &list_path)
            .codec_copy()
            .output_args(["-fflags", "+bitexact", "-movflags", "+faststart"]);

        let result = self
            .runner
            .run_with_progress(&cmd, |progress| {
                debug!(
                    frame = progress.frame,
                    out_secs = progress.out_time.as_secs_f64(),
                    finished = progress.finished,
                    "Concat progress"
                );
            })
            .await;
        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            debug!(path = %list_path.display(), "Could not remove concat list: {}", e);
        }
        result?;

        info!(segments = segments.len(), output = %output.display(), "Concatenated scenes");
        Ok(())
    }

    fn profile(&self) -> String {
        serde_json::to_string(&self.settings).unwrap_or_else(|_| format!("{:?}", self.settings))
    }
}
