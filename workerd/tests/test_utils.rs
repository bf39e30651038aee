//! Shared utilities for workerd integration tests.
//!
//! - An RPC test service with echo, failing and hanging methods
//! - Server and daemon startup on ephemeral ports
//! - Helpers for draining a remote output stream
//!
//! # Usage
//!
//! ```ignore
//! #[path = "test_utils.rs"]
//! mod test_utils;
//! use test_utils::*;
//! ```

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use workerd::protocol::TailRequest;
use workerd::registry::{self, Init, Runtime};
use workerd::rpc::codec::{decode, encode};
use workerd::{
    Client, Config, Context, Daemon, Error, Result, Server, Service, SupervisorClient,
    start_workerd,
};

// ============================================================================
// Test Service
// ============================================================================

/// Service used to exercise the transport.
#[derive(Default)]
pub struct TestService {
    /// Number of `Hang` handlers that observed their context finishing.
    pub hang_released: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for TestService {
    async fn call(&self, ctx: &Context, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Echo" => {
                let msg: String = decode(body)?;
                encode(&msg)
            }
            "Fail" => Err(Error::Net("some network error".to_string())),
            "Hang" => {
                let err = ctx.done().await;
                self.hang_released.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
            "Sleep" => {
                let ms: u64 = decode(body)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                encode(&ms)
            }
            other => Err(Error::Unsupported(format!("Test.{other}"))),
        }
    }
}

/// An RPC server on an ephemeral port, stopped on drop.
pub struct TestServer {
    pub addr: String,
    pub server: Server,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Starts a server hosting `service` under the name `Test`.
pub async fn start_test_server(service: TestService) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new();
    server.register("Test", service).unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let server = server.clone();
        let shutdown = shutdown.clone();
        async move { server.serve(listener, shutdown).await }
    });
    TestServer {
        addr,
        server,
        shutdown,
    }
}

// ============================================================================
// User Services
// ============================================================================

/// A user service with an init hook that offsets its base value.
#[derive(Serialize, Deserialize)]
pub struct Adder {
    pub base: i64,
}

#[async_trait]
impl Service for Adder {
    async fn call(&self, _ctx: &Context, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Add" => {
                let n: i64 = decode(body)?;
                encode(&(self.base + n))
            }
            other => Err(Error::Unsupported(format!("Adder.{other}"))),
        }
    }

    fn initializer(&mut self) -> Option<&mut dyn Init> {
        Some(self)
    }
}

impl Init for Adder {
    fn init(&mut self, _runtime: &Runtime) -> Result<()> {
        self.base += 1000;
        Ok(())
    }
}

/// A user service whose init panics.
#[derive(Serialize, Deserialize)]
pub struct Exploding;

#[async_trait]
impl Service for Exploding {
    async fn call(&self, _ctx: &Context, _method: &str, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn initializer(&mut self) -> Option<&mut dyn Init> {
        Some(self)
    }
}

impl Init for Exploding {
    fn init(&mut self, _runtime: &Runtime) -> Result<()> {
        panic!("init failed on purpose");
    }
}

pub fn register_user_services() {
    registry::register::<Adder>();
    registry::register::<Exploding>();
}

// ============================================================================
// Daemon Helpers
// ============================================================================

pub fn test_workdir() -> PathBuf {
    std::env::temp_dir().join(format!("workerd-test-{}", uuid::Uuid::new_v4()))
}

/// Starts a daemon on an ephemeral port with short keepalive bounds.
pub async fn start_test_daemon() -> Daemon {
    let config = Config {
        listen_addr: "127.0.0.1:0".to_string(),
        workdir: test_workdir(),
        min_keepalive: Duration::from_millis(10),
        keepalive_grace: Duration::from_millis(200),
        ..Default::default()
    };
    start_workerd(config).await.unwrap()
}

pub fn supervisor_client(daemon: &Daemon) -> SupervisorClient {
    SupervisorClient::new(Client::tcp(), daemon.addr().to_string())
}

pub fn ctx(secs: u64) -> Context {
    Context::background().with_timeout(Duration::from_secs(secs))
}

/// Tails `fd` from offset 0 until the stream reports eof.
pub async fn read_to_eof(client: &SupervisorClient, fd: u32) -> Vec<u8> {
    let ctx = ctx(10);
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let chunk = client.tail(&ctx, TailRequest { fd, offset }).await.unwrap();
        out.extend_from_slice(&chunk.data);
        offset = chunk.next_offset;
        if chunk.eof {
            return out;
        }
    }
}
