//! Building and running ffmpeg invocations.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};
use crate::progress::{is_progress_line, RenderProgress};

const TAIL_LINES: usize = 20;

/// Argument list for one ffmpeg invocation.
///
/// Inputs keep their insertion order, so `[0:v]`, `[1:a]` and friends in a
/// filter graph refer to them by position.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<(Vec<String>, PathBuf)>,
    args: Vec<String>,
    output: PathBuf,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            args: Vec::new(),
            output: output.as_ref().to_path_buf(),
        }
    }

    pub fn input(self, path: impl AsRef<Path>) -> Self {
        self.input_with_args(Vec::<String>::new(), path)
    }

    /// Input preceded by options that apply to it alone, e.g. `-f concat`.
    pub fn input_with_args<I, S>(mut self, options: I, path: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = options.into_iter().map(Into::into).collect();
        self.inputs.push((options, path.as_ref().to_path_buf()));
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn filter_complex(self, graph: impl Into<String>) -> Self {
        self.output_args(["-filter_complex".to_string(), graph.into()])
    }

    pub fn map(self, label: impl Into<String>) -> Self {
        self.output_args(["-map".to_string(), label.into()])
    }

    /// Cut the output at `secs`, millisecond precision.
    pub fn output_duration(self, secs: f64) -> Self {
        self.output_args(["-t".to_string(), format!("{:.3}", secs)])
    }

    pub fn codec_copy(self) -> Self {
        self.output_args(["-c", "copy"])
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Full argument vector, overwrite and progress flags included.
    pub fn build_args(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = ["-y", "-v", "error", "-nostats", "-progress", "pipe:2"]
            .into_iter()
            .map(OsString::from)
            .collect();
        for (options, path) in &self.inputs {
            argv.extend(options.iter().map(OsString::from));
            argv.push("-i".into());
            argv.push(path.clone().into_os_string());
        }
        argv.extend(self.args.iter().map(OsString::from));
        argv.push(self.output.clone().into_os_string());
        argv
    }
}

/// Runs ffmpeg with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRunner {
    timeout: Option<Duration>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        self.run_with_progress(cmd, |_| {}).await
    }

    /// Run `cmd`, reporting each progress block to `on_progress`.
    pub async fn run_with_progress<F>(
        &self,
        cmd: &FfmpegCommand,
        mut on_progress: F,
    ) -> MediaResult<()>
    where
        F: FnMut(RenderProgress) + Send + 'static,
    {
        check_ffmpeg()?;
        let argv = cmd.build_args();
        debug!(output = %cmd.output_path().display(), "ffmpeg {:?}", argv);

        let mut child = Command::new("ffmpeg")
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::tool_failed("ffmpeg", "stderr was not piped", None, None))?;

        // Progress lines go to the callback; everything else is kept as a
        // bounded tail for the error report.
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut progress = RenderProgress::default();
            let mut tail = VecDeque::with_capacity(TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if is_progress_line(&line) {
                    if let Some(snapshot) = progress.feed(&line) {
                        on_progress(snapshot);
                    }
                    continue;
                }
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let waited = self.wait(&mut child).await;
        let tail = reader.await.unwrap_or_default();
        let status = waited?;

        if status.success() {
            return Ok(());
        }
        let tail = (!tail.is_empty()).then(|| Vec::from(tail).join("\n"));
        Err(MediaError::tool_failed(
            "ffmpeg",
            format!("writing {}", cmd.output_path().display()),
            status.code(),
            tail,
        ))
    }

    async fn wait(&self, child: &mut Child) -> MediaResult<std::process::ExitStatus> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait().await?);
        };
        let waited = tokio::time::timeout(timeout, child.wait()).await;
        match waited {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(?timeout, "ffmpeg exceeded its deadline, killing");
                let _ = child.kill().await;
                Err(MediaError::TimedOut(timeout))
            }
        }
    }
}

/// Run a short-lived tool to completion and return its stdout.
pub(crate) async fn capture<I, S>(
    tool: &'static str,
    args: I,
    context: &Path,
) -> MediaResult<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(MediaError::tool_failed(
        tool,
        context.display().to_string(),
        output.status.code(),
        (!stderr.is_empty()).then_some(stderr),
    ))
}

pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::ToolMissing("ffmpeg"))
}

pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::ToolMissing("ffprobe"))
}
