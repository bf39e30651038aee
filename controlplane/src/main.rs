//! # Controlplane Binary
//!
//! Boots one machine against a running `workerd` and streams its output.
//!
//! ## Usage
//! ```bash
//! controlplane --addr 10.0.0.7:7070 --binary ./job --env MODE=batch -- --input data.txt
//! ```

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use controlplane::{Cli, run_machine};

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run_machine(cli).await {
        error!(error = %err, "controlplane failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
