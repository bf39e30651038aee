//! # Machine Configuration
//!
//! Options that shape a [`Machine`](crate::Machine)'s boot sequence and
//! keepalive monitoring. Zero durations are filled by
//! [`MachineConfig::apply_defaults`].
//!
//! | Option                  | Default    | Meaning                                      |
//! |-------------------------|------------|----------------------------------------------|
//! | `keepalive_period`      | 1 min      | Interval proposed to the remote              |
//! | `keepalive_timeout`     | 2 min      | Unreachability tolerated before `Stopped`    |
//! | `keepalive_rpc_timeout` | 10 s       | Bound on a single keepalive/ping call        |
//! | `rpc_timeout`           | 30 s       | Bound on each boot-sequence call             |
//! | `upload_timeout`        | 5 min      | Bound on the `SetBinary` upload              |
//! | `owner`                 | `true`     | Run the full boot and extend the lease       |

use std::path::PathBuf;
use std::time::Duration;

use workerd::ServiceSpec;

/// Where the executable staged on the remote comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BinarySource {
    /// The running executable; the driver and the remote run the same binary.
    #[default]
    CurrentExe,
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl BinarySource {
    pub async fn load(&self) -> std::io::Result<Vec<u8>> {
        match self {
            BinarySource::CurrentExe => tokio::fs::read(std::env::current_exe()?).await,
            BinarySource::Path(path) => tokio::fs::read(path).await,
            BinarySource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Configuration for one machine.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub keepalive_period: Duration,
    pub keepalive_timeout: Duration,
    pub keepalive_rpc_timeout: Duration,
    pub rpc_timeout: Duration,
    pub upload_timeout: Duration,

    /// `KEY=VALUE` entries for the executed binary, in order
    pub environ: Vec<String>,

    /// Arguments for the executed binary, excluding the program name
    pub args: Vec<String>,

    /// Services registered during boot, in order
    pub services: Vec<ServiceSpec>,

    /// Whether this process owns the remote and keeps its lease alive
    pub owner: bool,

    pub binary: BinarySource,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            keepalive_period: Duration::ZERO,
            keepalive_timeout: Duration::ZERO,
            keepalive_rpc_timeout: Duration::ZERO,
            rpc_timeout: Duration::ZERO,
            upload_timeout: Duration::ZERO,
            environ: Vec::new(),
            args: Vec::new(),
            services: Vec::new(),
            owner: true,
            binary: BinarySource::default(),
        }
    }
}

impl MachineConfig {
    /// Applies sensible defaults for any unset or zero values.
    pub fn apply_defaults(&mut self) {
        if self.keepalive_period == Duration::ZERO {
            self.keepalive_period = Duration::from_secs(60);
        }
        if self.keepalive_timeout == Duration::ZERO {
            self.keepalive_timeout = Duration::from_secs(2 * 60);
        }
        if self.keepalive_rpc_timeout == Duration::ZERO {
            self.keepalive_rpc_timeout = Duration::from_secs(10);
        }
        if self.rpc_timeout == Duration::ZERO {
            self.rpc_timeout = Duration::from_secs(30);
        }
        if self.upload_timeout == Duration::ZERO {
            self.upload_timeout = Duration::from_secs(5 * 60);
        }
    }

    /// Delay before probing again after a failed keepalive.
    pub fn retry_interval(&self) -> Duration {
        self.keepalive_period.min(Duration::from_secs(1))
    }
}
