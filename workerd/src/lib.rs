//! # Workerd - Remote Supervisor Daemon
//!
//! Workerd is the process that runs on every remote machine. It serves the
//! supervisor protocol over RPC so a driver can stage and launch a binary,
//! register user services into it, and keep it alive.
//!
//! - **RPC Transport**: `"Service.Method"` calls with deadlines and cancellation
//! - **Supervisor**: environment, arguments, binary staging and exec
//! - **Service Registry**: encodable user services with fail-fast init
//! - **Keepalive Lease**: the daemon exits when its driver stops renewing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          workerd                         │
//! ├──────────────────────────────────────────────────────────┤
//! │   ┌──────────────┐    ┌──────────────┐   ┌────────────┐  │
//! │   │  Supervisor  │    │ user service │   │    ...     │  │
//! │   └──────┬───────┘    └──────┬───────┘   └─────┬──────┘  │
//! │          └───────────────────┴─────────────────┘         │
//! │                              │                           │
//! │                      ┌───────┴───────┐                   │
//! │                      │  ServiceTable │                   │
//! │                      └───────┬───────┘                   │
//! │                      ┌───────┴───────┐                   │
//! │                      │  rpc::Server  │                   │
//! │                      └───────────────┘                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Daemon configuration and defaults
//! - [`rpc`]: Client, server, context and error taxonomy
//! - [`protocol`]: Supervisor operations, wire types and typed client
//! - [`registry`]: Service type registry and fail-fast initialization
//! - [`supervisor`]: The daemon-side supervisor
//! - [`digest`]: Binary fingerprints
//!
//! # Example
//!
//! ```rust,ignore
//! let mut config = workerd::Config::default();
//! config.listen_addr = "127.0.0.1:0".into();
//! let daemon = workerd::start_workerd(config).await?;
//! println!("listening on {}", daemon.addr());
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod config;
pub mod digest;
pub mod output;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod supervisor;

pub use config::Config;
pub use digest::Digest;
pub use protocol::{SupervisorApi, SupervisorClient};
pub use registry::{Runtime, ServiceSpec};
pub use rpc::{Client, Context, Error, ErrorKind, Result, Server, Service};
pub use supervisor::Supervisor;

/// A running daemon: its RPC server and supervisor.
pub struct Daemon {
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    server: Server,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Daemon {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Cancelled when the daemon shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the child process and the RPC server.
    pub async fn close(self) {
        self.supervisor.shutdown().await;
        self.shutdown.cancel();
        let _ = self.handle.await;
        info!(addr = %self.addr, "workerd stopped");
    }
}

/// Binds the RPC listener, installs the supervisor and starts serving.
///
/// # Arguments
/// * `config` - Daemon configuration; unset fields are defaulted
///
/// # Returns
/// * `Ok(daemon)` - Serving in a background task
/// * `Err(_)` - If the listener could not be bound
pub async fn start_workerd(mut config: Config) -> Result<Daemon> {
    config.apply_defaults();
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let server = Server::new();
    let runtime = Runtime::new(Some(addr.to_string()), shutdown.clone());
    let supervisor = Supervisor::install(&server, config, runtime)?;

    let handle = tokio::spawn({
        let server = server.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = server.serve(listener, shutdown).await {
                error!(error = %err, "rpc server error");
            }
        }
    });

    info!(%addr, "workerd started");
    Ok(Daemon {
        addr,
        supervisor,
        server,
        shutdown,
        handle,
    })
}
