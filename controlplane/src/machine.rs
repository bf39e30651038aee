//! # Machine Lifecycle
//!
//! A [`Machine`] is the local handle for one remote worker: its lifecycle
//! state and its call channel.
//!
//! # State Machine
//!
//! ```text
//!              boot ok              keepalive timeout / cancel
//!   Starting ──────────▶ Running ─────────────────────────────▶ Stopped
//!      │                                                          ▲
//!      └───────────── boot step failed / cancel ──────────────────┘
//! ```
//!
//! Transitions only move forward. `Stopped` is absorbing and satisfies every
//! waiter, so [`Machine::wait`] never blocks past a terminal transition.
//!
//! # Boot Sequence
//!
//! Each step starts only after the previous one succeeded:
//!
//! 1. `SetEnviron`, `SetArgs`
//! 2. `SetBinary` with the configured [`BinarySource`](crate::BinarySource)
//! 3. `Info`: the remote digest must equal the staged image's digest
//! 4. `Exec`
//! 5. `Register` for every configured service
//! 6. One healthy `Keepalive`
//!
//! A machine that does not own its remote (`owner = false`) replaces the
//! sequence with a single `Info` reachability check.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use workerd::protocol::{self, Info, SERVICE, TailChunk, TailRequest};
use workerd::rpc::codec;
use workerd::{Client, Context, Digest, Error, Result, Service, ServiceSpec, SupervisorClient};

use crate::config::MachineConfig;
use crate::keepalive;

/// Lifecycle state. The ordering is the order of transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum State {
    Starting,
    Running,
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Starting => "starting",
            State::Running => "running",
            State::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Status {
    last_keepalive: Option<Instant>,
    error: Option<Error>,
}

#[derive(Default)]
struct Tasks {
    started: bool,
    boot: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    id: Uuid,
    addr: String,
    client: Client,
    supervisor: SupervisorClient,
    config: MachineConfig,
    state: watch::Sender<State>,
    status: Mutex<Status>,
    cancel: CancellationToken,
    tasks: Mutex<Tasks>,
}

/// Handle to one remote worker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Machine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Machine {
    /// Creates a machine bound to `addr` using plain TCP.
    pub fn new(addr: impl Into<String>, config: MachineConfig) -> Self {
        Self::with_client(addr, Client::tcp(), config)
    }

    /// Creates a machine that reaches `addr` through `client`.
    pub fn with_client(addr: impl Into<String>, client: Client, mut config: MachineConfig) -> Self {
        config.apply_defaults();
        let addr = addr.into();
        let (state, _) = watch::channel(State::Starting);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                supervisor: SupervisorClient::new(client.clone(), addr.clone()),
                addr,
                client,
                config,
                state,
                status: Mutex::new(Status::default()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn config(&self) -> &MachineConfig {
        &self.inner.config
    }

    /// Starts the boot sequence in the background. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks();
        if tasks.started {
            return;
        }
        tasks.started = true;
        let machine = self.clone();
        tasks.boot = Some(tokio::spawn(async move { machine.boot().await }));
    }

    /// Current state, without blocking.
    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    /// Waits until the machine is in `target` or a later state and returns
    /// the state observed.
    pub async fn wait(&self, target: State) -> State {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            Err(_) => State::Stopped,
        }
    }

    /// Error that drove the machine to `Stopped`, if any.
    pub fn error(&self) -> Option<Error> {
        self.status().error.clone()
    }

    /// Time of the last successful keepalive (or ping, for non-owners).
    pub fn last_keepalive(&self) -> Option<Instant> {
        self.status().last_keepalive
    }

    /// Stops the machine. Idempotent; never waits for in-flight work.
    pub fn cancel(&self) {
        self.stop(Error::Canceled);
    }

    /// Cancels the machine and waits for its background tasks to finish.
    pub async fn shutdown(&self) {
        self.cancel();
        // Boot stores the monitor handle; join it first.
        let boot = self.tasks().boot.take();
        if let Some(boot) = boot {
            let _ = boot.await;
        }
        let monitor = self.tasks().monitor.take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
    }

    /// Calls `"Service.Method"` on the remote.
    ///
    /// Fails immediately once the machine is stopped, and in-flight calls
    /// return as soon as the machine stops.
    pub async fn call<A, R>(&self, ctx: &Context, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.state() == State::Stopped {
            return Err(self.stopped_error());
        }
        let body = codec::encode(arg)?;
        let reply = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(self.stopped_error()),
            reply = self.inner.client.call_raw(ctx, &self.inner.addr, method, body) => reply?,
        };
        codec::decode(&reply)
    }

    pub async fn info(&self, ctx: &Context) -> Result<Info> {
        self.call(ctx, &supervisor_method(protocol::method::INFO), &()).await
    }

    pub async fn ping(&self, ctx: &Context, seq: u64) -> Result<u64> {
        self.call(ctx, &supervisor_method(protocol::method::PING), &seq).await
    }

    /// Registers `instance` under `name` on a booted machine. An
    /// unregistered or unencodable service type fails here, locally.
    pub async fn register<T>(&self, ctx: &Context, name: &str, instance: &T) -> Result<()>
    where
        T: Service + Serialize,
    {
        let spec = ServiceSpec::new(name, instance)?;
        self.call(ctx, &supervisor_method(protocol::method::REGISTER), &spec).await
    }

    /// Streams the remote process output on `fd` until it ends, the
    /// context finishes, or the machine stops.
    pub fn tail(
        &self,
        ctx: Context,
        fd: u32,
    ) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        let machine = self.clone();
        let method = supervisor_method(protocol::method::TAIL);
        futures::stream::unfold(Some(0u64), move |offset| {
            let machine = machine.clone();
            let ctx = ctx.clone();
            let method = method.clone();
            async move {
                let mut offset = offset?;
                loop {
                    let req = TailRequest { fd, offset };
                    match machine.call::<_, TailChunk>(&ctx, &method, &req).await {
                        Err(err) => return Some((Err(err), None)),
                        Ok(chunk) if chunk.data.is_empty() && chunk.eof => return None,
                        Ok(chunk) if chunk.data.is_empty() => offset = chunk.next_offset,
                        Ok(chunk) => {
                            let next = (!chunk.eof).then_some(chunk.next_offset);
                            return Some((Ok(chunk.data), next));
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle internals, shared with the keepalive monitor.
    // ------------------------------------------------------------------

    pub(crate) fn supervisor(&self) -> &SupervisorClient {
        &self.inner.supervisor
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// A context for an internal call: bounded by `timeout` and aborted when
    /// the machine stops.
    pub(crate) fn internal_context(&self, timeout: Duration) -> Context {
        Context::from_token(self.inner.cancel.child_token()).with_timeout(timeout)
    }

    pub(crate) fn touch(&self) {
        self.status().last_keepalive = Some(Instant::now());
    }

    /// Drives the machine to `Stopped`, recording `err` if it is the first
    /// cause.
    pub(crate) fn stop(&self, err: Error) {
        {
            let mut status = self.status();
            if status.error.is_none() && self.state() != State::Stopped {
                status.error = Some(err.clone());
            }
        }
        if self.transition(State::Stopped) {
            let (id, addr) = (&self.inner.id, &self.inner.addr);
            match err {
                Error::Canceled => info!(%id, %addr, "machine cancelled"),
                err => warn!(%id, %addr, error = %err, "machine stopped"),
            }
        }
        self.inner.cancel.cancel();
    }

    fn transition(&self, to: State) -> bool {
        self.inner.state.send_if_modified(|state| {
            if to > *state {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn stopped_error(&self) -> Error {
        match self.error() {
            Some(err) => Error::Unavailable(format!("machine {} stopped: {err}", self.inner.addr)),
            None => Error::Unavailable(format!("machine {} stopped", self.inner.addr)),
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn boot(&self) {
        info!(
            id = %self.inner.id,
            addr = %self.inner.addr,
            owner = self.inner.config.owner,
            "booting machine"
        );
        let result = tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Canceled),
            result = self.bootstrap() => result,
        };
        match result {
            Ok(()) => {
                if self.transition(State::Running) {
                    info!(id = %self.inner.id, addr = %self.inner.addr, "machine running");
                    let machine = self.clone();
                    self.tasks().monitor = Some(tokio::spawn(keepalive::monitor(machine)));
                }
            }
            Err(err) => self.stop(err),
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        let sup = &self.inner.supervisor;
        let cfg = &self.inner.config;
        if !cfg.owner {
            let info = sup.info(&self.internal_context(cfg.rpc_timeout)).await?;
            debug!(os = %info.os, arch = %info.arch, "attached to remote");
            self.touch();
            return Ok(());
        }

        sup.set_environ(&self.internal_context(cfg.rpc_timeout), &cfg.environ).await?;
        sup.set_args(&self.internal_context(cfg.rpc_timeout), &cfg.args).await?;

        let image = cfg
            .binary
            .load()
            .await
            .map_err(|e| Error::invalid(format!("load binary: {e}")))?;
        let digest = Digest::of(&image);
        sup.set_binary(&self.internal_context(cfg.upload_timeout), &image).await?;
        debug!(%digest, size = image.len(), "binary staged");

        let info = sup.info(&self.internal_context(cfg.rpc_timeout)).await?;
        if info.digest.as_ref() != Some(&digest) {
            return Err(Error::invalid(format!(
                "binary digest mismatch: staged {digest}, remote reports {}",
                info.digest.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string())
            )));
        }

        sup.exec(&self.internal_context(cfg.rpc_timeout), None).await?;

        for spec in &cfg.services {
            sup.register(&self.internal_context(cfg.rpc_timeout), spec).await?;
            debug!(service = %spec.name, "service registered");
        }

        let reply = sup
            .keepalive(
                &self.internal_context(cfg.keepalive_rpc_timeout),
                cfg.keepalive_period,
            )
            .await?;
        if !reply.healthy {
            return Err(Error::Unavailable("remote reported unhealthy".to_string()));
        }
        self.touch();
        Ok(())
    }
}

fn supervisor_method(method: &str) -> String {
    format!("{SERVICE}.{method}")
}
