use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use calico_accountant::{agent, config};

/// Per-workload network policy packet accounting for Calico nodes.
#[derive(Parser)]
#[command(name = "calico-accountant", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
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

/// Build-time version info, injected via RUSTFLAGS.
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

    if let Some(Command::Version) = &cli.command {
        println!("calico-accountant {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = config::Config::load(cli.config.as_deref()).context("loading config")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        metrics_addr = %cfg.metrics_addr,
        minimum_counter = cfg.minimum_counter,
        "starting calico-accountant",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

async fn run(cfg: config::Config) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut agent = agent::Agent::new(cfg)?;
    let fatal = agent.fatal();

    // Stay responsive to signals while binding and resolving the node.
    let started = tokio::select! {
        res = agent.start() => {
            res?;
            true
        }
        res = &mut shutdown => {
            res?;
            false
        }
    };

    if !started {
        agent.stop().await?;
        return Ok(());
    }

    let failed = tokio::select! {
        res = &mut shutdown => {
            res?;
            false
        }
        _ = fatal.cancelled() => true,
    };

    agent.stop().await?;

    if failed {
        bail!("stopping after unrecoverable scrape error");
    }

    tracing::info!("calico-accountant stopped");

    Ok(())
}
