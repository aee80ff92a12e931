//! End-to-end composition tests against a real ffmpeg.

use std::path::{Path, PathBuf};

use vgen_media::{
    decoded_md5, probe_media, Composer, FfmpegCommand, FfmpegComposer, FfmpegRunner, MediaError,
    SceneMux,
};
use vgen_models::{AudioPolicy, RenderSettings};

async fn synth_clip(path: &Path, secs: f64, with_audio: bool) {
    let mut cmd = FfmpegCommand::new(path).input_with_args(
        ["-f", "lavfi"],
        format!("testsrc=size=320x240:rate=30:duration={}", secs),
    );
    if with_audio {
        cmd = cmd
            .input_with_args(
                ["-f", "lavfi"],
                format!("sine=frequency=220:duration={}", secs),
            )
            .output_args(["-c:a", "aac"]);
    }
    let cmd = cmd.output_args(["-c:v", "libx264", "-pix_fmt", "yuv420p"]);
    FfmpegRunner::new().run(&cmd).await.unwrap();
}

async fn synth_narration(path: &Path, secs: f64) {
    let cmd = FfmpegCommand::new(path)
        .input_with_args(
            ["-f", "lavfi"],
            format!("sine=frequency=440:duration={}", secs),
        )
        .output_args(["-c:a", "libmp3lame"]);
    FfmpegRunner::new().run(&cmd).await.unwrap();
}

async fn mux(
    composer: &FfmpegComposer,
    dir: &Path,
    index: u32,
    video_secs: f64,
    narration_secs: f64,
) -> PathBuf {
    let video = dir.join(format!("clip-{}.mp4", index));
    let narration = dir.join(format!("voice-{}.mp3", index));
    synth_clip(&video, video_secs, index % 2 == 0).await;
    synth_narration(&narration, narration_secs).await;

    composer
        .mux_scene(&SceneMux {
            scene_index: index,
            video,
            narration,
            output: dir.join(format!("scene-{}.mp4", index)),
        })
        .await
        .unwrap()
        .output
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_pad_video_keeps_full_narration() {
    let dir = tempfile::tempdir().unwrap();
    let composer = FfmpegComposer::new(RenderSettings::default().with_policy(AudioPolicy::PadVideo));

    let scene = mux(&composer, dir.path(), 1, 2.0, 3.5).await;
    let info = probe_media(&scene).await.unwrap();

    let video = info.video.expect("scene has a video stream");
    assert!(info.has_audio);
    assert_eq!((video.width, video.height), (1280, 720));
    assert!((info.duration_secs - 3.5).abs() < 0.15, "duration {}", info.duration_secs);
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_truncate_audio_matches_video_length() {
    let dir = tempfile::tempdir().unwrap();
    let composer =
        FfmpegComposer::new(RenderSettings::default().with_policy(AudioPolicy::TruncateAudio));

    let scene = mux(&composer, dir.path(), 0, 2.0, 3.5).await;
    let info = probe_media(&scene).await.unwrap();
    assert!((info.duration_secs - 2.0).abs() < 0.15, "duration {}", info.duration_secs);
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_concat_is_decoded_content_stable() {
    let dir = tempfile::tempdir().unwrap();
    let composer = FfmpegComposer::new(RenderSettings::default());

    let first = mux(&composer, dir.path(), 0, 1.0, 1.5).await;
    let second = mux(&composer, dir.path(), 1, 2.0, 1.0).await;
    let segments = vec![first, second];

    let out_a = dir.path().join("final-a.mp4");
    let out_b = dir.path().join("final-b.mp4");
    composer.concat(&segments, &out_a).await.unwrap();
    composer.concat(&segments, &out_b).await.unwrap();

    let info = probe_media(&out_a).await.unwrap();
    assert!((info.duration_secs - 3.5).abs() < 0.25, "duration {}", info.duration_secs);
    assert_eq!(
        decoded_md5(&out_a).await.unwrap(),
        decoded_md5(&out_b).await.unwrap()
    );
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_clip_without_video_is_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let composer = FfmpegComposer::new(RenderSettings::default());
    let narration = dir.path().join("voice.mp3");
    synth_narration(&narration, 1.0).await;

    let err = composer
        .mux_scene(&SceneMux {
            scene_index: 0,
            video: narration.clone(),
            narration,
            output: dir.path().join("scene-0.mp4"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::Unusable { .. }), "{err}");
}

#[tokio::test]
async fn test_concat_without_segments_fails() {
    let dir = tempfile::tempdir().unwrap();
    let composer = FfmpegComposer::new(RenderSettings::default());
    let err = composer
        .concat(&[], &dir.path().join("final.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::EmptyConcat));
}

#[tokio::test]
async fn test_failed_concat_removes_list_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("final.mp4");
    let composer = FfmpegComposer::new(RenderSettings::default());

    // Fails whether or not ffmpeg is installed: the segment does not exist
    let missing = vec![dir.path().join("scene-000.mp4")];
    assert!(composer.concat(&missing, &output).await.is_err());
    assert!(!output.with_extension("concat.txt").exists());
    assert!(!output.exists());
}
