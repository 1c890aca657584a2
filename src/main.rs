use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use eventwatch::agent::{self, Supervisor, SupervisorSettings};
use eventwatch::config::Config;
use eventwatch::export::health::HealthMetrics;
use eventwatch::export::SnapshotExporter;
use eventwatch::source::file::FileEventSource;

/// Supervised event log monitor with periodic JSON snapshots.
#[derive(Parser)]
#[command(name = "eventwatch", about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory snapshots are written to. Overrides Settings.output_dir.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("eventwatch {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let mut cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(dir) = cli.output_dir {
        cfg.settings.output_dir = dir;
    }

    tracing::info!(version = version::RELEASE, "starting eventwatch");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let targets = cfg.targets()?;
    let settings = &cfg.settings;

    let health = Arc::new(HealthMetrics::new(&settings.health_addr)?);
    if health.is_enabled() {
        health.start().await?;
    }

    let source = Arc::new(FileEventSource::new(
        &settings.source_root,
        settings.poll_interval,
    ));

    let supervisor = Supervisor::start(
        targets,
        source,
        SupervisorSettings::from(settings),
        SnapshotExporter::new(&settings.output_dir),
        Arc::clone(&health),
    )?;

    let result = agent::run_guarded(supervisor, shutdown).await;
    health.stop();

    let path = result?;
    tracing::info!(snapshot = %path.display(), "eventwatch stopped");

    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
                shutdown.cancel();
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received SIGINT, shutting down");
            shutdown.cancel();
        }
        Err(e) => tracing::error!(error = %e, "failed to listen for SIGINT"),
    }
}
