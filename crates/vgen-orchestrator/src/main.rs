//! Pipeline orchestrator binary.
//!
//! ```text
//! vgen run <request.json>   submit a request and wait for the result
//! vgen resume <run_id>      continue a run from its journal
//! vgen status <run_id>      print a run's status
//! vgen purge <run_id>       delete a run's stored artifacts
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vgen_media::FfmpegComposer;
use vgen_models::{PipelineRequest, RunId, RunStatusView};
use vgen_orchestrator::{JsonlJournal, Orchestrator, OrchestratorConfig, RunHandle};
use vgen_providers::ProviderSet;
use vgen_storage::{ArtifactStore, LocalStore, R2Config, R2Store};

const USAGE: &str =
    "usage: vgen <run <request.json> | resume <run_id> | status <run_id> | purge <run_id>>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(String),
    Resume(RunId),
    Status(RunId),
    Purge(RunId),
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let (command, arg) = match args {
            [command, arg] => (command.as_str(), arg.clone()),
            _ => bail!(USAGE),
        };
        Ok(match command {
            "run" => Command::Run(arg),
            "resume" => Command::Resume(RunId::from_string(arg)),
            "status" => Command::Status(RunId::from_string(arg)),
            "purge" => Command::Purge(RunId::from_string(arg)),
            _ => bail!(USAGE),
        })
    }
}

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(e) = run_cli(std::env::args().skip(1).collect()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    if let Ok(directive) = "vgen=info".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run_cli(args: Vec<String>) -> anyhow::Result<()> {
    let command = Command::parse(&args)?;

    let config = OrchestratorConfig::from_env();
    info!("Orchestrator config: {:?}", config);
    install_metrics_exporter()?;

    let orchestrator = build_orchestrator(config).await?;

    match command {
        Command::Run(path) => {
            let body = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path))?;
            let request: PipelineRequest =
                serde_json::from_str(&body).context("invalid request JSON")?;
            let handle = orchestrator.submit(request).await?;
            info!(run_id = %handle.run_id(), "Run submitted");
            finish(handle).await
        }
        Command::Resume(run_id) => {
            let handle = orchestrator.resume(&run_id).await?;
            finish(handle).await
        }
        Command::Status(run_id) => {
            let view = orchestrator.status(&run_id).await?;
            print_view(&view)
        }
        Command::Purge(run_id) => {
            let removed = orchestrator.purge(&run_id).await?;
            println!("removed {} objects from run {}", removed, run_id);
            Ok(())
        }
    }
}

async fn build_orchestrator(config: OrchestratorConfig) -> anyhow::Result<Orchestrator> {
    let store: Arc<dyn ArtifactStore> = if R2Config::is_configured() {
        let r2 = R2Config::from_env()?;
        info!("Using R2 bucket {}", r2.bucket);
        let store = R2Store::new(r2);
        store.check_connectivity().await?;
        Arc::new(store)
    } else {
        let root = config.work_dir.join("artifacts");
        info!("No bucket configured; storing artifacts under {}", root.display());
        Arc::new(LocalStore::new(root).await?)
    };

    let journal = Arc::new(JsonlJournal::new(&config.journal_dir).await?);
    let providers = ProviderSet::from_env().context("provider configuration")?;
    let composer = Arc::new(
        FfmpegComposer::new(config.render.clone()).with_timeout(config.ffmpeg_timeout),
    );

    Ok(Orchestrator::new(config, providers, store, journal, composer)?)
}

fn install_metrics_exporter() -> anyhow::Result<()> {
    let Ok(addr) = std::env::var("VGEN_METRICS_ADDR") else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid VGEN_METRICS_ADDR {}", addr))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!("Serving metrics on {}", addr);
    Ok(())
}

/// Wait for a run, cancelling it on Ctrl-C.
async fn finish(handle: RunHandle) -> anyhow::Result<()> {
    let canceller = handle.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal; cancelling run {}", canceller.run_id());
            canceller.cancel();
        }
    });

    let view = handle.wait().await;
    signal.abort();
    print_view(&view)
}

fn print_view(view: &RunStatusView) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(view)?);
    Ok(())
}
