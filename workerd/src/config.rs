//! # Configuration
//!
//! This module defines the configuration structure for the `workerd`
//! supervisor daemon. Values come from command-line flags or `WORKERD_*`
//! environment variables (see `main.rs`); any zero/empty field is filled by
//! [`Config::apply_defaults`].
//!
//! # Example
//!
//! ```rust,ignore
//! use workerd::Config;
//!
//! let mut config = Config {
//!     listen_addr: "127.0.0.1:0".to_string(),
//!     ..Default::default()
//! };
//! config.apply_defaults();
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a supervisor daemon instance.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Address the RPC server binds to
    pub listen_addr: String,

    /// Directory where staged executables are written before exec
    pub workdir: PathBuf,

    /// Smallest keepalive interval the supervisor accepts
    pub min_keepalive: Duration,

    /// Largest keepalive interval the supervisor accepts
    pub max_keepalive: Duration,

    /// Extra time past the accepted interval before the lease lapses
    pub keepalive_grace: Duration,

    /// Bytes of stdout/stderr retained per stream for `Tail`
    pub output_limit: usize,
}

impl Config {
    /// Applies sensible defaults for any unset or zero values.
    pub fn apply_defaults(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = "0.0.0.0:7070".to_string();
        }
        if self.workdir.as_os_str().is_empty() {
            self.workdir = std::env::temp_dir().join("workerd");
        }
        if self.min_keepalive == Duration::from_secs(0) {
            self.min_keepalive = Duration::from_millis(100);
        }
        if self.max_keepalive == Duration::from_secs(0) {
            self.max_keepalive = Duration::from_secs(10 * 60);
        }
        if self.keepalive_grace == Duration::from_secs(0) {
            self.keepalive_grace = Duration::from_secs(30);
        }
        if self.output_limit == 0 {
            self.output_limit = 1024 * 1024;
        }
    }

    /// Lease length granted for an accepted keepalive interval.
    pub fn lease_for(&self, accepted: Duration) -> Duration {
        accepted + self.keepalive_grace
    }
}
