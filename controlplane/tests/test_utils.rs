//! Shared utilities for controlplane integration tests.
//!
//! - A fake supervisor that records what the driver staged
//! - A `Test` service with echo and hanging methods
//! - User service types with good and panicking init hooks
//! - Machine construction against the fake
//!
//! # Usage
//!
//! ```ignore
//! #[path = "test_utils.rs"]
//! mod test_utils;
//! use test_utils::*;
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use controlplane::{BinarySource, Machine, MachineConfig, State};
use workerd::protocol::{Info, KeepaliveReply, SERVICE, SupervisorApi, SupervisorService};
use workerd::registry::{self, Init, Runtime};
use workerd::rpc::codec::{decode, encode};
use workerd::rpc::ServiceTable;
use workerd::{Context, Digest, Error, Result, Server, Service, ServiceSpec};

// ============================================================================
// Constants
// ============================================================================

pub const FAKE_BINARY: &[u8] = b"fake binary";

// ============================================================================
// Fake Supervisor
// ============================================================================

/// What the fake has been told, in call order.
#[derive(Debug, Default)]
pub struct Recorded {
    pub calls: Vec<&'static str>,
    pub environ: Vec<String>,
    pub args: Vec<String>,
    pub image: Option<Vec<u8>>,
    pub keepalives: usize,
    pub pings: usize,
    pub registered: Vec<String>,
}

/// In-process supervisor double.
pub struct FakeSupervisor {
    pub recorded: Mutex<Recorded>,
    services: Arc<ServiceTable>,
    /// Keepalives block until their context finishes.
    pub hung: AtomicBool,
    /// Keepalives report unhealthy.
    pub unhealthy: AtomicBool,
    /// Info reports a digest that does not match the staged image.
    pub wrong_digest: AtomicBool,
    /// SetEnviron blocks until its context finishes.
    pub stall_boot: AtomicBool,
}

impl FakeSupervisor {
    pub fn new(services: Arc<ServiceTable>) -> Self {
        Self {
            recorded: Mutex::new(Recorded::default()),
            services,
            hung: AtomicBool::new(false),
            unhealthy: AtomicBool::new(false),
            wrong_digest: AtomicBool::new(false),
            stall_boot: AtomicBool::new(false),
        }
    }

    fn record(&self, call: &'static str) -> std::sync::MutexGuard<'_, Recorded> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.calls.push(call);
        recorded
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.recorded.lock().unwrap().calls.clone()
    }

    pub fn keepalives(&self) -> usize {
        self.recorded.lock().unwrap().keepalives
    }
}

#[async_trait]
impl SupervisorApi for FakeSupervisor {
    async fn set_environ(&self, ctx: &Context, environ: Vec<String>) -> Result<()> {
        if self.stall_boot.load(Ordering::SeqCst) {
            return Err(ctx.done().await);
        }
        self.record("SetEnviron").environ = environ;
        Ok(())
    }

    async fn set_args(&self, _ctx: &Context, args: Vec<String>) -> Result<()> {
        self.record("SetArgs").args = args;
        Ok(())
    }

    async fn set_binary(&self, _ctx: &Context, image: Vec<u8>) -> Result<()> {
        self.record("SetBinary").image = Some(image);
        Ok(())
    }

    async fn get_binary(&self, _ctx: &Context) -> Result<Vec<u8>> {
        self.record("GetBinary")
            .image
            .clone()
            .ok_or_else(|| Error::invalid("no binary set"))
    }

    async fn exec(&self, _ctx: &Context, _image: Option<Vec<u8>>) -> Result<()> {
        self.record("Exec");
        Ok(())
    }

    async fn info(&self, _ctx: &Context) -> Result<Info> {
        let recorded = self.record("Info");
        let digest = if self.wrong_digest.load(Ordering::SeqCst) {
            Some(Digest::of(b"some other binary"))
        } else {
            recorded.image.as_deref().map(Digest::of)
        };
        Ok(Info {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            digest,
        })
    }

    async fn ping(&self, _ctx: &Context, seq: u64) -> Result<u64> {
        self.record("Ping").pings += 1;
        Ok(seq)
    }

    async fn keepalive(&self, ctx: &Context, next: Duration) -> Result<KeepaliveReply> {
        if self.hung.load(Ordering::SeqCst) {
            return Err(ctx.done().await);
        }
        self.record("Keepalive").keepalives += 1;
        Ok(KeepaliveReply {
            next,
            healthy: !self.unhealthy.load(Ordering::SeqCst),
        })
    }

    async fn register(&self, _ctx: &Context, spec: ServiceSpec) -> Result<()> {
        self.record("Register");
        let service = registry::decode(&spec)?;
        let service = registry::maybe_init(service, &Runtime::detached()).await?;
        self.services.register(&spec.name, Arc::from(service))?;
        self.recorded.lock().unwrap().registered.push(spec.name);
        Ok(())
    }
}

// ============================================================================
// Test Service
// ============================================================================

/// Transport test service, hosted next to the fake supervisor.
pub struct TestService;

#[async_trait]
impl Service for TestService {
    async fn call(&self, ctx: &Context, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Echo" => {
                let msg: String = decode(body)?;
                encode(&msg)
            }
            "Hang" => Err(ctx.done().await),
            other => Err(Error::Unsupported(format!("Test.{other}"))),
        }
    }
}

// ============================================================================
// User Services
// ============================================================================

#[derive(Serialize, Deserialize)]
pub struct Greeter {
    pub greeting: String,
}

#[async_trait]
impl Service for Greeter {
    async fn call(&self, _ctx: &Context, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Greet" => {
                let name: String = decode(body)?;
                encode(&format!("{}, {name}", self.greeting))
            }
            other => Err(Error::Unsupported(format!("Greeter.{other}"))),
        }
    }

    fn initializer(&mut self) -> Option<&mut dyn Init> {
        Some(self)
    }
}

impl Init for Greeter {
    fn init(&mut self, _runtime: &Runtime) -> Result<()> {
        self.greeting = self.greeting.to_uppercase();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
pub struct PanicOnInit;

#[async_trait]
impl Service for PanicOnInit {
    async fn call(&self, _ctx: &Context, _method: &str, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn initializer(&mut self) -> Option<&mut dyn Init> {
        Some(self)
    }
}

impl Init for PanicOnInit {
    fn init(&mut self, _runtime: &Runtime) -> Result<()> {
        panic!("panic during init");
    }
}

/// Never passed to `registry::register`.
#[derive(Serialize, Deserialize)]
pub struct NotRegistered;

#[async_trait]
impl Service for NotRegistered {
    async fn call(&self, _ctx: &Context, _method: &str, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

pub fn register_user_services() {
    registry::register::<Greeter>();
    registry::register::<PanicOnInit>();
}

// ============================================================================
// Remote Setup
// ============================================================================

/// A fake remote on an ephemeral port, stopped on drop.
pub struct FakeRemote {
    pub addr: String,
    pub supervisor: Arc<FakeSupervisor>,
    shutdown: CancellationToken,
}

impl Drop for FakeRemote {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_fake_remote() -> FakeRemote {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new();
    let supervisor = Arc::new(FakeSupervisor::new(server.services()));
    server
        .register(SERVICE, SupervisorService::new(supervisor.clone()))
        .unwrap();
    server.register("Test", TestService).unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.serve(listener, shutdown).await }
    });
    FakeRemote {
        addr,
        supervisor,
        shutdown,
    }
}

/// Machine configuration with short timeouts and the fake binary.
pub fn test_config() -> MachineConfig {
    MachineConfig {
        keepalive_period: Duration::from_millis(50),
        keepalive_timeout: Duration::from_millis(500),
        keepalive_rpc_timeout: Duration::from_millis(100),
        rpc_timeout: Duration::from_secs(5),
        binary: BinarySource::Bytes(FAKE_BINARY.to_vec()),
        ..Default::default()
    }
}

/// Starts a fake remote and a started machine bound to it.
pub async fn new_test_machine(config: MachineConfig) -> (Machine, FakeRemote) {
    let remote = start_fake_remote().await;
    let machine = Machine::new(remote.addr.clone(), config);
    machine.start();
    (machine, remote)
}

/// Waits for `target`, failing the test after `limit`.
pub async fn wait_within(machine: &Machine, target: State, limit: Duration) -> State {
    tokio::time::timeout(limit, machine.wait(target))
        .await
        .unwrap_or_else(|_| panic!("machine did not reach {target} within {limit:?}"))
}

pub fn ctx(secs: u64) -> Context {
    Context::background().with_timeout(Duration::from_secs(secs))
}

/// Polls `cond` every 10ms until it holds, failing after `limit`.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
