//! # RPC Client
//!
//! Each call dials a fresh connection through the configured [`Dialer`],
//! writes one request frame, and waits for one response frame. The whole
//! exchange runs under the caller's [`Context`]: when the context finishes
//! first, the exchange future is dropped, the connection closes, and the
//! server cancels the handler it was running for us.
//!
//! Connections are never shared between calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use super::codec::{self, Request, Response};
use super::context::Context;
use super::error::{Error, Result};

/// Default TCP connect timeout when the caller's context has no deadline.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A bidirectional byte stream usable as an RPC connection.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Connection factory. Swap it out to run the transport over TLS or any
/// other stream.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn Connection>>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn Connection>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Issues calls against any server address. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    dialer: Arc<dyn Dialer>,
}

impl Client {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }

    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpDialer::default()))
    }

    /// Calls `method` (`"Service.Method"`) at `addr`.
    ///
    /// The argument is encoded before anything touches the network, so an
    /// unencodable argument fails with `Invalid` and no connection is made.
    /// A finished context yields `Canceled`/`DeadlineExceeded` immediately,
    /// without waiting for the remote side.
    pub async fn call<A, R>(&self, ctx: &Context, addr: &str, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = codec::encode(arg)?;
        let reply = self.call_raw(ctx, addr, method, body).await?;
        codec::decode(&reply)
    }

    /// Like [`call`](Self::call) with pre-encoded argument and reply bytes.
    pub async fn call_raw(
        &self,
        ctx: &Context,
        addr: &str,
        method: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let request = Request {
            method: method.to_string(),
            timeout_ms: ctx.remaining().map(|d| d.as_millis() as u64),
            body,
        };
        trace!(%addr, %method, "rpc call");
        ctx.run(self.exchange(addr, request)).await
    }

    async fn exchange(&self, addr: &str, request: Request) -> Result<Vec<u8>> {
        let mut conn = self.dialer.dial(addr).await.map_err(Error::net)?;
        codec::write_frame(&mut conn, &request).await?;
        let response: Response = codec::read_frame(&mut conn).await?;
        response.result.map_err(Error::from)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}
