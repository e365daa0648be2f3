//! specd - Spec Orchestrator Daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use specd::{Daemon, DaemonConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "specd", about = "Spec-driven development orchestrator daemon")]
struct Args {
    /// Path to the SQLite database.
    #[arg(long, env = "SPECD_DB")]
    db_path: Option<PathBuf>,

    /// Path to a config.yaml (defaults apply when omitted).
    #[arg(long, env = "SPECD_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum concurrent workers (overrides config).
    #[arg(long)]
    max_concurrency: Option<usize>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::default();
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    config.config_path = args.config;
    config.max_concurrency = args.max_concurrency;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon.shutdown().await;
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}
