use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use relayoor::config::Config;
use relayoor::downstream::UdpForwarder;
use relayoor::export::HealthServer;
use relayoor::relay::Relay;
use relayoor::server::IngestServer;
use relayoor::stats::Collector;

/// Adaptive sampling relay for statsd telemetry.
#[derive(Parser)]
#[command(name = "relayoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("relayoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the relay run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting relayoor",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Set up signal handling.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }

            cancel.cancel();
        });
    }

    let collector = Collector::default();

    if !cfg.health.addr.is_empty() {
        let health = HealthServer::new(&cfg.health.addr, collector.clone());
        health.start(cancel.clone()).await?;
    }

    let forwarder = UdpForwarder::connect(&cfg.downstream.endpoint).await?;
    let relay = Relay::new(&cfg, forwarder, &collector.scope("relay"))?;

    let (lines_tx, lines_rx) = tokio::sync::mpsc::channel(cfg.server.channel_capacity);
    let server = IngestServer::new(cfg.server.clone(), collector.scope("server"));
    server.start(lines_tx, cancel.clone()).await?;

    // The relay task owns every piece of keyed state; wait for it to
    // drain before exiting.
    let relay_task = tokio::spawn(relay.run(lines_rx, cancel.clone()));

    cancel.cancelled().await;
    if let Err(e) = relay_task.await {
        tracing::warn!(error = %e, "relay task join failed");
    }

    tracing::info!("relayoor stopped");

    Ok(())
}
