//! # Workerd CLI
//!
//! Command-line entry point for the remote supervisor daemon.
//!
//! # Usage
//!
//! ```bash
//! workerd --listen 0.0.0.0:7070 --workdir /var/lib/workerd
//! ```
//!
//! # Environment Variables
//!
//! All CLI arguments can also be set via environment variables:
//!
//! - `WORKERD_LISTEN`: RPC listen address
//! - `WORKERD_WORKDIR`: Directory for staged executables
//! - `WORKERD_MIN_KEEPALIVE_MS` / `WORKERD_MAX_KEEPALIVE_SECS`: accepted keepalive range
//! - `WORKERD_KEEPALIVE_GRACE_SECS`: lease slack past the accepted interval
//! - `WORKERD_OUTPUT_LIMIT`: retained stdout/stderr bytes per stream
//!
//! The daemon exits when its keepalive lease lapses, on ctrl+c, or on SIGTERM
//! (which is forwarded to the running process first).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use workerd::{Config, start_workerd};

/// Command-line arguments for the supervisor daemon.
#[derive(Parser, Debug)]
#[command(name = "workerd", author, version, about = "Remote supervisor daemon")]
struct Args {
    /// Address the RPC server binds to
    #[arg(long, env = "WORKERD_LISTEN", default_value = "0.0.0.0:7070")]
    listen: String,

    /// Directory where staged executables are written
    #[arg(long, env = "WORKERD_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Smallest accepted keepalive interval (milliseconds)
    #[arg(long, env = "WORKERD_MIN_KEEPALIVE_MS", default_value_t = 100)]
    min_keepalive_ms: u64,

    /// Largest accepted keepalive interval (seconds)
    #[arg(long, env = "WORKERD_MAX_KEEPALIVE_SECS", default_value_t = 600)]
    max_keepalive_secs: u64,

    /// Lease slack past the accepted keepalive interval (seconds)
    #[arg(long, env = "WORKERD_KEEPALIVE_GRACE_SECS", default_value_t = 30)]
    keepalive_grace_secs: u64,

    /// Bytes of stdout/stderr retained per stream
    #[arg(long, env = "WORKERD_OUTPUT_LIMIT", default_value_t = 1024 * 1024)]
    output_limit: usize,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "workerd failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let mut cfg = Config {
        listen_addr: args.listen,
        workdir: args.workdir.unwrap_or_default(),
        min_keepalive: Duration::from_millis(args.min_keepalive_ms),
        max_keepalive: Duration::from_secs(args.max_keepalive_secs),
        keepalive_grace: Duration::from_secs(args.keepalive_grace_secs),
        output_limit: args.output_limit,
    };
    cfg.apply_defaults();

    let daemon = start_workerd(cfg).await.context("start workerd")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let supervisor = daemon.supervisor().clone();
    tokio::select! {
        _ = supervisor.lease_expired() => {
            warn!("keepalive lease expired, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, forwarding to process");
            supervisor.signal(libc::SIGTERM).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received ctrl+c, shutting down");
        }
    }

    daemon.close().await;
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
