use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use tickflow::config::Config;
use tickflow::export::ClickHouseWriter;
use tickflow::migrate::{ClickHouseMigrator, Migrator, SchemaNames};
use tickflow::{agent, config};

/// Real-time market-data ingester.
#[derive(Parser)]
#[command(name = "tickflow", about)]
struct Cli {
    /// Path to the YAML configuration file. Without it, configuration comes
    /// from defaults and the environment.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to `log_level` from the config.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Run ClickHouse schema migrations and exit.
    Migrate {
        #[arg(value_enum, default_value_t = Direction::Up)]
        direction: Direction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Up,
    Down,
    Status,
}

/// Build-time version info, injected via the environment.
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
        println!("tickflow {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { direction }) => rt.block_on(migrate(cfg, direction)),
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting tickflow",
            );
            rt.block_on(run(cfg))
        }
    }
}

async fn run(cfg: config::Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("tickflow stopped");

    Ok(())
}

async fn migrate(cfg: config::Config, direction: Direction) -> Result<()> {
    let mut writer = ClickHouseWriter::new(cfg.clickhouse.clone());
    writer.start().await.context("connecting to ClickHouse")?;

    let pool = writer
        .pool()
        .context("ClickHouse pool not initialized")?
        .clone();
    let migrator = ClickHouseMigrator::new(pool, SchemaNames::from_config(writer.config()));

    match direction {
        Direction::Up => migrator.up().await?,
        Direction::Down => migrator.down().await?,
        Direction::Status => {
            let version = migrator.status().await?;
            tracing::info!(version, "schema version");
        }
    }

    writer.stop().await
}
