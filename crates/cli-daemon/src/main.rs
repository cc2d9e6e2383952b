//! CLI entry point for compressd
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use compressd::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// compressd - watches a directory and compresses new videos with ffmpeg
#[derive(Parser, Debug)]
#[command(name = "compressd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip probing ffmpeg at startup. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(config = %args.config.display(), "compressd starting");

    let daemon_result = if args.skip_checks {
        warn!("skipping ffmpeg startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map_err(Into::into)
            .and_then(Daemon::new_without_checks)
    } else {
        Daemon::new(&args.config).await
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        workers = daemon.concurrency_plan.max_concurrent_jobs,
        cores = daemon.concurrency_plan.total_cores,
        "daemon initialized"
    );
    if daemon.config.metrics.enabled {
        info!(listen = %daemon.config.metrics.listen, "metrics enabled at /metrics");
    }

    if let Err(e) = daemon.run_until_signal().await {
        error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
