//! # Controlplane
//!
//! Controlplane is the driver side of the remote execution runtime. It
//! bootstraps a binary onto a remote `workerd`, drives the remote through its
//! lifecycle, and calls supervisor and user services on it:
//!
//! - **Machine lifecycle**: `Starting → Running → Stopped`, with waits that
//!   never outlive a terminal transition
//! - **Boot sequence**: environment, arguments, binary, digest check, exec,
//!   service registration, first keepalive
//! - **Keepalive monitoring**: a background probe that stops the machine once
//!   the remote has been unreachable for too long
//!
//! ## Architecture
//!
//! - [`machine`]: [`Machine`], its state machine and call channel
//! - [`keepalive`]: the per-machine monitor task
//! - [`config`]: [`MachineConfig`] and [`BinarySource`]
//!
//! The transport, wire types and supervisor protocol come from `workerd`, so
//! both sides share one definition.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use workerd::Context;
use workerd::protocol::STDOUT;

pub mod config;
pub mod keepalive;
pub mod machine;

pub use config::{BinarySource, MachineConfig};
pub use machine::{Machine, State};

/// Command-line interface for booting one machine against a running
/// `workerd`.
///
/// All options can also be set via `CONTROLPLANE_*` environment variables.
/// Arguments after `--` are passed to the executed binary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address of the remote workerd
    #[arg(long, env = "CONTROLPLANE_ADDR", default_value = "127.0.0.1:7070")]
    pub addr: String,

    /// Executable to stage on the remote (defaults to this binary)
    #[arg(long, env = "CONTROLPLANE_BINARY")]
    pub binary: Option<PathBuf>,

    /// `KEY=VALUE` environment entries for the executed binary
    #[arg(long = "env", env = "CONTROLPLANE_ENV", value_delimiter = ',')]
    pub environ: Vec<String>,

    /// Interval between keepalives (seconds)
    #[arg(long, env = "CONTROLPLANE_KEEPALIVE_PERIOD_SECS", default_value_t = 60)]
    pub keepalive_period_secs: u64,

    /// Unreachability tolerated before the machine is stopped (seconds)
    #[arg(long, env = "CONTROLPLANE_KEEPALIVE_TIMEOUT_SECS", default_value_t = 120)]
    pub keepalive_timeout_secs: u64,

    /// Bound on each boot-sequence call (seconds)
    #[arg(long, env = "CONTROLPLANE_RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub rpc_timeout_secs: u64,

    /// How long to wait for the machine to reach running (seconds)
    #[arg(long, env = "CONTROLPLANE_BOOT_TIMEOUT_SECS", default_value_t = 300)]
    pub boot_timeout_secs: u64,

    /// Attach to an already-booted remote instead of owning it
    #[arg(long, env = "CONTROLPLANE_ATTACH", default_value_t = false)]
    pub attach: bool,

    /// Arguments for the executed binary
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7070".to_string(),
            binary: None,
            environ: Vec::new(),
            keepalive_period_secs: 60,
            keepalive_timeout_secs: 120,
            rpc_timeout_secs: 30,
            boot_timeout_secs: 300,
            attach: false,
            args: Vec::new(),
        }
    }
}

impl Cli {
    /// Machine configuration described by these arguments.
    pub fn machine_config(&self) -> MachineConfig {
        let mut cfg = MachineConfig {
            keepalive_period: Duration::from_secs(self.keepalive_period_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            environ: self.environ.clone(),
            args: self.args.clone(),
            owner: !self.attach,
            binary: self
                .binary
                .clone()
                .map(BinarySource::Path)
                .unwrap_or_default(),
            ..Default::default()
        };
        cfg.apply_defaults();
        cfg
    }
}

/// Boots a machine, prints its `Info` as JSON and streams the remote
/// process's stdout until it ends, the machine stops, or ctrl+c.
///
/// # Returns
/// * `Ok(())` - After a clean shutdown
/// * `Err(_)` - If the machine never reached running
pub async fn run_machine(cli: Cli) -> Result<()> {
    let machine = Machine::new(cli.addr.clone(), cli.machine_config());
    machine.start();

    let boot_timeout = Duration::from_secs(cli.boot_timeout_secs);
    let state = tokio::time::timeout(boot_timeout, machine.wait(State::Running))
        .await
        .context("timed out waiting for machine to boot")?;
    if state != State::Running {
        let cause = machine
            .error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        bail!("machine {} failed to boot: {cause}", machine.addr());
    }

    let ctx = Context::background().with_timeout(Duration::from_secs(cli.rpc_timeout_secs));
    let info = machine.info(&ctx).await.context("query remote info")?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    let output = async {
        if cli.attach {
            std::future::pending::<()>().await;
        }
        let mut stdout = tokio::io::stdout();
        let mut stream = Box::pin(machine.tail(Context::background(), STDOUT));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(err) = forward(&mut stdout, &bytes).await {
                        warn!(error = %err, "local stdout closed");
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "tail failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = output => info!("remote output ended"),
        state = machine.wait(State::Stopped) => info!(%state, "machine stopped"),
        _ = tokio::signal::ctrl_c() => info!("Received ctrl+c, shutting down"),
    }

    machine.shutdown().await;
    Ok(())
}

async fn forward<W: AsyncWrite + Unpin>(out: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    out.write_all(bytes).await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cli_config() {
        let cli = Cli::default();
        assert_eq!(cli.addr, "127.0.0.1:7070");
        assert!(!cli.attach);
        assert!(cli.environ.is_empty());
    }

    #[test]
    fn test_machine_config_from_cli() {
        let cli = Cli {
            environ: vec!["K=V".to_string()],
            attach: true,
            binary: Some(PathBuf::from("/bin/true")),
            ..Default::default()
        };
        let cfg = cli.machine_config();
        assert!(!cfg.owner);
        assert_eq!(cfg.environ, vec!["K=V".to_string()]);
        assert_eq!(cfg.binary, BinarySource::Path(PathBuf::from("/bin/true")));
        assert_eq!(cfg.keepalive_rpc_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_forward_reports_closed_output() {
        let (mut writer, reader) = tokio::io::duplex(16);
        forward(&mut writer, b"hello").await.unwrap();
        drop(reader);
        assert!(forward(&mut writer, b"more").await.is_err());
    }
}
