//! # Supervisor Protocol
//!
//! The fixed set of operations every remote supervisor exposes under the
//! service name [`SERVICE`]. The protocol is a trait, [`SupervisorApi`], so
//! the lifecycle code can be driven against test doubles; [`SupervisorService`]
//! adapts any implementation to the generic RPC [`Service`] interface, and
//! [`SupervisorClient`] is the typed caller-side stub.
//!
//! | Method       | Argument              | Reply            |
//! |--------------|-----------------------|------------------|
//! | `SetEnviron` | `Vec<String>`         | `()`             |
//! | `SetArgs`    | `Vec<String>`         | `()`             |
//! | `SetBinary`  | `Vec<u8>`             | `()`             |
//! | `GetBinary`  | `()`                  | `Vec<u8>`        |
//! | `Exec`       | `Option<Vec<u8>>`     | `()`             |
//! | `Info`       | `()`                  | [`Info`]         |
//! | `Ping`       | `u64`                 | `u64`            |
//! | `Keepalive`  | `Duration`            | [`KeepaliveReply`] |
//! | `Tail`       | [`TailRequest`]       | [`TailChunk`]    |
//! | `Register`   | [`ServiceSpec`]       | `()`             |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::registry::ServiceSpec;
use crate::rpc::codec::{decode, encode};
use crate::rpc::{Client, Context, Error, Result, Service};

/// Name the supervisor is registered under on every remote server.
pub const SERVICE: &str = "Supervisor";

/// Method names, without the service prefix.
pub mod method {
    pub const SET_ENVIRON: &str = "SetEnviron";
    pub const SET_ARGS: &str = "SetArgs";
    pub const SET_BINARY: &str = "SetBinary";
    pub const GET_BINARY: &str = "GetBinary";
    pub const EXEC: &str = "Exec";
    pub const INFO: &str = "Info";
    pub const PING: &str = "Ping";
    pub const KEEPALIVE: &str = "Keepalive";
    pub const TAIL: &str = "Tail";
    pub const REGISTER: &str = "Register";
}

/// Remote environment snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub os: String,
    pub arch: String,
    /// Digest of the staged binary; `None` when nothing is staged.
    pub digest: Option<Digest>,
}

/// Reply to a keepalive: the interval the supervisor accepted and whether it
/// considers itself healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveReply {
    pub next: Duration,
    pub healthy: bool,
}

/// Standard output of the executed process.
pub const STDOUT: u32 = 1;
/// Standard error of the executed process.
pub const STDERR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailRequest {
    pub fd: u32,
    /// Absolute byte offset to read from.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailChunk {
    pub data: Vec<u8>,
    /// Offset to pass in the next request.
    pub next_offset: u64,
    /// The stream is closed and fully consumed.
    pub eof: bool,
}

/// Operations a remote supervisor must provide.
#[async_trait]
pub trait SupervisorApi: Send + Sync + 'static {
    /// Replaces the environment (`KEY=VALUE` entries) for subsequent execs.
    async fn set_environ(&self, ctx: &Context, environ: Vec<String>) -> Result<()>;

    /// Replaces the arguments (excluding the program name) for subsequent execs.
    async fn set_args(&self, ctx: &Context, args: Vec<String>) -> Result<()>;

    /// Replaces the staged executable image and records its digest.
    async fn set_binary(&self, ctx: &Context, image: Vec<u8>) -> Result<()>;

    /// Returns the staged image; `Invalid` when none is staged.
    async fn get_binary(&self, ctx: &Context) -> Result<Vec<u8>>;

    /// Launches the staged image, or `image` when given.
    async fn exec(&self, ctx: &Context, image: Option<Vec<u8>>) -> Result<()>;

    async fn info(&self, ctx: &Context) -> Result<Info>;

    async fn ping(&self, ctx: &Context, seq: u64) -> Result<u64>;

    /// Proposes the interval until the next keepalive. Must return promptly
    /// with the context's error when the context finishes first.
    async fn keepalive(&self, ctx: &Context, next: Duration) -> Result<KeepaliveReply>;

    async fn tail(&self, _ctx: &Context, _req: TailRequest) -> Result<TailChunk> {
        Err(Error::Unsupported("tail is not supported".to_string()))
    }

    /// Decodes, initializes and registers a user service.
    async fn register(&self, ctx: &Context, spec: ServiceSpec) -> Result<()>;
}

/// Exposes a [`SupervisorApi`] implementation as an RPC [`Service`].
pub struct SupervisorService<S> {
    inner: Arc<S>,
}

impl<S: SupervisorApi> SupervisorService<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: SupervisorApi> Service for SupervisorService<S> {
    async fn call(&self, ctx: &Context, op: &str, body: &[u8]) -> Result<Vec<u8>> {
        let s = &self.inner;
        match op {
            method::SET_ENVIRON => encode(&s.set_environ(ctx, decode(body)?).await?),
            method::SET_ARGS => encode(&s.set_args(ctx, decode(body)?).await?),
            method::SET_BINARY => encode(&s.set_binary(ctx, decode(body)?).await?),
            method::GET_BINARY => encode(&s.get_binary(ctx).await?),
            method::EXEC => encode(&s.exec(ctx, decode(body)?).await?),
            method::INFO => encode(&s.info(ctx).await?),
            method::PING => encode(&s.ping(ctx, decode(body)?).await?),
            method::KEEPALIVE => encode(&s.keepalive(ctx, decode(body)?).await?),
            method::TAIL => encode(&s.tail(ctx, decode(body)?).await?),
            method::REGISTER => encode(&s.register(ctx, decode(body)?).await?),
            other => Err(Error::Unsupported(format!("{SERVICE}.{other}"))),
        }
    }
}

/// Typed stub for calling a remote supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorClient {
    client: Client,
    addr: String,
}

impl SupervisorClient {
    pub fn new(client: Client, addr: impl Into<String>) -> Self {
        Self {
            client,
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call<A, R>(&self, ctx: &Context, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let target = format!("{SERVICE}.{method}");
        self.client.call(ctx, &self.addr, &target, arg).await
    }

    pub async fn set_environ(&self, ctx: &Context, environ: &[String]) -> Result<()> {
        self.call(ctx, method::SET_ENVIRON, environ).await
    }

    pub async fn set_args(&self, ctx: &Context, args: &[String]) -> Result<()> {
        self.call(ctx, method::SET_ARGS, args).await
    }

    pub async fn set_binary(&self, ctx: &Context, image: &[u8]) -> Result<()> {
        self.call(ctx, method::SET_BINARY, image).await
    }

    pub async fn get_binary(&self, ctx: &Context) -> Result<Vec<u8>> {
        self.call(ctx, method::GET_BINARY, &()).await
    }

    pub async fn exec(&self, ctx: &Context, image: Option<&[u8]>) -> Result<()> {
        self.call(ctx, method::EXEC, &image).await
    }

    pub async fn info(&self, ctx: &Context) -> Result<Info> {
        self.call(ctx, method::INFO, &()).await
    }

    pub async fn ping(&self, ctx: &Context, seq: u64) -> Result<u64> {
        self.call(ctx, method::PING, &seq).await
    }

    pub async fn keepalive(&self, ctx: &Context, next: Duration) -> Result<KeepaliveReply> {
        self.call(ctx, method::KEEPALIVE, &next).await
    }

    pub async fn tail(&self, ctx: &Context, req: TailRequest) -> Result<TailChunk> {
        self.call(ctx, method::TAIL, &req).await
    }

    pub async fn register(&self, ctx: &Context, spec: &ServiceSpec) -> Result<()> {
        self.call(ctx, method::REGISTER, spec).await
    }
}
