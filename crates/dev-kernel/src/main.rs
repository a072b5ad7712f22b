//! Dev kernel CLI entry point.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use kernel::KernelConfig;
use tracing::{error, info};

use dev_kernel::KernelRunner;

/// Autonomous development kernel: schedules ready issues from the beads
/// graph, dispatches them to LLM toolchains in isolated workcells,
/// verifies the output through quality gates, and writes results back.
#[derive(Debug, Parser)]
#[command(name = "dev-kernel", version)]
struct Cli {
    /// Path to the kernel config file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run exactly one scheduling cycle, then exit.
    #[arg(long)]
    single_cycle: bool,

    /// Restrict work to this issue and its transitive blockers.
    #[arg(long)]
    issue: Option<String>,

    /// Override the workcell concurrency limit.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Mark every admitted issue for speculate+vote.
    #[arg(long)]
    force_speculate: bool,

    /// Compute and print the schedule without dispatching.
    #[arg(long)]
    dry_run: bool,

    /// Keep polling for new ready work instead of exiting when idle.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Config errors are fatal at startup: readable message, non-zero exit.
    let mut config = match &cli.config {
        Some(path) => match KernelConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                std::process::exit(2);
            }
        },
        None => KernelConfig::default(),
    };

    // Runtime flag overrides.
    if let Some(max_concurrent) = cli.max_concurrent {
        config.max_concurrent_workcells = max_concurrent;
    }
    config.force_speculate = cli.force_speculate || config.force_speculate;
    config.dry_run = cli.dry_run || config.dry_run;
    config.watch_mode = cli.watch || config.watch_mode;
    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(2);
    }

    let runner = KernelRunner::new(config, cli.single_cycle, cli.issue)?;

    // Ctrl-C flips the stop flag: in-flight dispatches finish, no new
    // cycle starts, and the summary still prints.
    let stop = runner.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; stopping after in-flight work");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let stats = runner.run().await;
    info!(
        completed = stats.issues_completed,
        failed = stats.issues_failed,
        "Dev kernel exiting"
    );

    if runner.had_graph_error() {
        std::process::exit(1);
    }
    Ok(())
}
