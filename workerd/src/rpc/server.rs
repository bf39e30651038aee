//! # RPC Server
//!
//! The server owns a [`ServiceTable`] (name → service object) and dispatches
//! each incoming `"Service.Method"` request to the matching [`Service`].
//!
//! # Connection Handling
//!
//! ```text
//! accept ──▶ read Request ──┬──▶ dispatch(ctx) ──▶ write Response
//!                           │
//!                           └──▶ watch for hang-up ──▶ cancel ctx, drop handler
//! ```
//!
//! The handler's [`Context`] carries the caller's remaining deadline and is
//! cancelled as soon as the caller goes away, so a handler blocked on
//! `ctx.done()` returns instead of lingering.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::Connection;
use super::codec::{self, Request, Response};
use super::context::Context;
use super::error::{Error, Result, WireError};

/// A remotely callable object, dispatched by method name.
///
/// Arguments and replies arrive and leave as encoded bytes; implementations
/// typically `codec::decode` the argument, do the work, and `codec::encode`
/// the reply.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, ctx: &Context, method: &str, body: &[u8]) -> Result<Vec<u8>>;

    /// Optional one-time setup capability. Most services have none.
    fn initializer(&mut self) -> Option<&mut dyn crate::registry::Init> {
        None
    }
}

/// Registered services, keyed by name. Names are write-once.
#[derive(Default)]
pub struct ServiceTable {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service. A name that is already taken is rejected.
    pub fn register(&self, name: &str, service: Arc<dyn Service>) -> Result<()> {
        if name.is_empty() || name.contains('.') {
            return Err(Error::invalid(format!("bad service name {name:?}")));
        }
        let mut guard = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(name) {
            return Err(Error::invalid(format!("service {name} already registered")));
        }
        guard.insert(name.to_string(), service);
        info!(service = %name, "service registered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolves `"Service.Method"` and invokes it.
    pub async fn dispatch(&self, ctx: &Context, target: &str, body: &[u8]) -> Result<Vec<u8>> {
        let (service, method) = target
            .split_once('.')
            .ok_or_else(|| Error::invalid(format!("malformed method {target:?}")))?;
        let svc = self
            .get(service)
            .ok_or_else(|| Error::invalid(format!("unknown service {service}")))?;
        svc.call(ctx, method, body).await
    }
}

/// Serves a [`ServiceTable`] over any stream transport.
#[derive(Clone, Default)]
pub struct Server {
    services: Arc<ServiceTable>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, service: impl Service) -> Result<()> {
        self.services.register(name, Arc::new(service))
    }

    /// Shared handle to the table, for services that register other services.
    pub fn services(&self) -> Arc<ServiceTable> {
        self.services.clone()
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "rpc server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(addr = %local, "rpc server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let server = self.clone();
                            let token = shutdown.child_token();
                            tokio::spawn(async move {
                                debug!(%peer, "connection accepted");
                                server.serve_connection(stream, token).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
    }

    /// Handles one request on an established connection.
    pub async fn serve_connection<C: Connection>(&self, conn: C, shutdown: CancellationToken) {
        let (mut reader, mut writer) = tokio::io::split(conn);
        let request: Request = match codec::read_frame(&mut reader).await {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "failed to read request");
                return;
            }
        };

        let mut ctx = Context::from_token(shutdown.child_token());
        if let Some(ms) = request.timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(ms));
        }

        let dispatch = self.services.dispatch(&ctx, &request.method, &request.body);
        let hangup = async {
            let mut buf = [0u8; 1];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };

        let result = tokio::select! {
            result = dispatch => result,
            _ = hangup => {
                ctx.token().cancel();
                debug!(method = %request.method, "caller hung up; handler cancelled");
                return;
            }
        };

        if let Err(err) = &result {
            debug!(method = %request.method, error = %err, "call failed");
        }
        let response = Response {
            result: result.map_err(|e| WireError::from(&e)),
        };
        if let Err(err) = codec::write_frame(&mut writer, &response).await {
            debug!(method = %request.method, error = %err, "failed to write response");
        }
    }
}
