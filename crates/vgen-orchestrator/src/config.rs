//! Orchestrator configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vgen_models::{AudioPolicy, RenderSettings, TaskKind};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::RetryPolicy;

/// One value per task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerKind<T> {
    pub outline: T,
    pub script: T,
    pub image: T,
    pub clip: T,
    pub voice: T,
}

impl<T: Copy> PerKind<T> {
    pub fn uniform(value: T) -> Self {
        Self {
            outline: value,
            script: value,
            image: value,
            clip: value,
            voice: value,
        }
    }

    pub fn get(&self, kind: TaskKind) -> T {
        match kind {
            TaskKind::Outline => self.outline,
            TaskKind::Script => self.script,
            TaskKind::Image => self.image,
            TaskKind::Clip => self.clip,
            TaskKind::Voice => self.voice,
        }
    }

    pub fn set(&mut self, kind: TaskKind, value: T) {
        match kind {
            TaskKind::Outline => self.outline = value,
            TaskKind::Script => self.script = value,
            TaskKind::Image => self.image = value,
            TaskKind::Clip => self.clip = value,
            TaskKind::Voice => self.voice = value,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrent provider calls per kind
    pub concurrency: PerKind<usize>,
    /// Deadline of a single provider call per kind
    pub call_timeouts: PerKind<Duration>,
    /// Task-level retry policy
    pub retry: RetryPolicy,
    /// Retry policy for artifact store I/O during assembly
    pub io_retry: RetryPolicy,
    /// Whole-run deadline (scheduling only; assembly is bounded per ffmpeg call)
    pub run_timeout: Option<Duration>,
    /// Scratch directory for assembly
    pub work_dir: PathBuf,
    /// Directory of the JSONL run journal
    pub journal_dir: PathBuf,
    /// Per ffmpeg invocation timeout during assembly
    pub ffmpeg_timeout: Duration,
    pub render: RenderSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: PerKind {
                outline: 1,
                script: 4,
                image: 8,
                clip: 4,
                voice: 16,
            },
            call_timeouts: PerKind {
                outline: Duration::from_secs(180),
                script: Duration::from_secs(120),
                image: Duration::from_secs(180),
                clip: Duration::from_secs(900),
                voice: Duration::from_secs(120),
            },
            retry: RetryPolicy::default(),
            io_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5)),
            run_timeout: None,
            work_dir: PathBuf::from("/tmp/vgen"),
            journal_dir: PathBuf::from("/tmp/vgen/journal"),
            ffmpeg_timeout: Duration::from_secs(600),
            render: RenderSettings::default(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl OrchestratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut concurrency = defaults.concurrency;
        let mut call_timeouts = defaults.call_timeouts;
        for kind in TaskKind::ALL {
            let upper = kind.as_str().to_ascii_uppercase();
            if let Some(n) = env_parse(&format!("VGEN_MAX_{}_PARALLEL", upper)) {
                concurrency.set(kind, n);
            }
            if let Some(secs) = env_parse(&format!("VGEN_{}_TIMEOUT_SECS", upper)) {
                call_timeouts.set(kind, Duration::from_secs(secs));
            }
        }

        let retry = RetryPolicy::new(
            env_parse("VGEN_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
            env_parse("VGEN_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            env_parse("VGEN_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        );

        let work_dir = std::env::var("VGEN_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);
        let journal_dir = std::env::var("VGEN_JOURNAL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("journal"));

        let audio_policy = env_parse::<AudioPolicy>("VGEN_AUDIO_POLICY").unwrap_or_default();

        Self {
            concurrency,
            call_timeouts,
            retry,
            io_retry: defaults.io_retry,
            run_timeout: env_parse("VGEN_RUN_TIMEOUT_SECS").map(Duration::from_secs),
            work_dir,
            journal_dir,
            ffmpeg_timeout: env_parse("VGEN_FFMPEG_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ffmpeg_timeout),
            render: defaults.render.with_policy(audio_policy),
        }
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> OrchestratorResult<()> {
        for kind in TaskKind::ALL {
            if self.concurrency.get(kind) == 0 {
                return Err(OrchestratorError::config_error(format!(
                    "concurrency budget for {} must be at least 1",
                    kind
                )));
            }
            if self.call_timeouts.get(kind).is_zero() {
                return Err(OrchestratorError::config_error(format!(
                    "call timeout for {} must be positive",
                    kind
                )));
            }
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(OrchestratorError::config_error(
                "retry base delay exceeds max delay",
            ));
        }
        Ok(())
    }
}
