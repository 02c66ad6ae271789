use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use queryreplay::{collect, config, replay};

/// MySQL query capture, corpus building, and replay load testing.
#[derive(Parser)]
#[command(name = "queryreplay", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect queries from a capture into a replay corpus.
    Collect {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Replay a corpus against a target MySQL instance.
    Replay {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("queryreplay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cli.command).await })
}

async fn run(command: Command) -> Result<()> {
    // A signal cancels the run token; pipelines treat that as clean
    // shutdown and the process exits zero.
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match command {
        Command::Collect { config: path } => {
            let cfg = config::CollectConfig::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            collect::run(cfg, cancel).await
        }
        Command::Replay { config: path } => {
            let cfg = config::ReplayConfig::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            replay::run(cfg, cancel).await
        }
        Command::Version => unreachable!("handled before runtime start"),
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
