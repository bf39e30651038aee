//! # Supervisor
//!
//! The daemon-side implementation of [`SupervisorApi`]. One supervisor runs
//! per remote machine and:
//! - Stages an environment, argument vector and executable image
//! - Launches the staged image as a child process, capturing its output
//! - Registers user services into the shared [`ServiceTable`]
//! - Holds a keepalive lease; when the lease lapses the child is stopped
//!   and the daemon exits (see `main.rs`)
//!
//! # Process Lifecycle
//!
//! ```text
//! Exec ──▶ write image (0755) ──▶ spawn ──▶ pump stdout/stderr ──▶ OutputLog
//!                                   │
//!                                   └──▶ wait task ──▶ exit status ──▶ healthy
//! ```
//!
//! At most one child runs at a time. A child that exits unsuccessfully marks
//! the supervisor unhealthy, which is reported on the next keepalive.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::digest::Digest;
use crate::output::OutputLog;
use crate::protocol::{
    Info, KeepaliveReply, SERVICE, STDERR, STDOUT, SupervisorApi, SupervisorService, TailChunk,
    TailRequest,
};
use crate::registry::{self, Runtime, ServiceSpec};
use crate::rpc::{Context, Error, Result, Server, ServiceTable};

#[derive(Default)]
struct Staging {
    environ: Vec<String>,
    args: Vec<String>,
    image: Option<Arc<Vec<u8>>>,
    digest: Option<Digest>,
}

struct ProcessHandle {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    kill: CancellationToken,
}

impl ProcessHandle {
    fn running(&self) -> bool {
        !*self.exited.borrow()
    }
}

pub struct Supervisor {
    config: Config,
    runtime: Runtime,
    services: Arc<ServiceTable>,
    staging: Mutex<Staging>,
    process: tokio::sync::Mutex<Option<ProcessHandle>>,
    stdout: Arc<OutputLog>,
    stderr: Arc<OutputLog>,
    lease: watch::Sender<Option<Instant>>,
    healthy: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Config, services: Arc<ServiceTable>, runtime: Runtime) -> Self {
        let (lease, _) = watch::channel(None);
        Self {
            stdout: Arc::new(OutputLog::new(config.output_limit)),
            stderr: Arc::new(OutputLog::new(config.output_limit)),
            config,
            runtime,
            services,
            staging: Mutex::new(Staging::default()),
            process: tokio::sync::Mutex::new(None),
            lease,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates a supervisor sharing `server`'s service table and registers
    /// it under [`SERVICE`].
    pub fn install(server: &Server, config: Config, runtime: Runtime) -> Result<Arc<Self>> {
        let supervisor = Arc::new(Self::new(config, server.services(), runtime));
        server.register(SERVICE, SupervisorService::new(supervisor.clone()))?;
        Ok(supervisor)
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Current lease deadline; `None` until the first keepalive.
    pub fn lease_deadline(&self) -> Option<Instant> {
        *self.lease.borrow()
    }

    /// Completes once a lease has been granted and then allowed to lapse.
    pub async fn lease_expired(&self) {
        let mut rx = self.lease.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep_until(deadline).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sends `signal` to the running child, if any.
    pub async fn signal(&self, signal: i32) {
        let process = self.process.lock().await;
        if let Some(pid) = process.as_ref().filter(|p| p.running()).and_then(|p| p.pid) {
            debug!(pid, signal, "forwarding signal to process");
            // SAFETY: `pid` comes from `Child::id()` of a process we spawned
            // and have not yet reaped. A failed kill() is harmless here.
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }

    /// Kills the running child, if any, and waits for it to be reaped.
    pub async fn shutdown(&self) {
        let mut exited = {
            let process = self.process.lock().await;
            match process.as_ref() {
                Some(p) if p.running() => {
                    p.kill.cancel();
                    p.exited.clone()
                }
                _ => return,
            }
        };
        let _ = exited.wait_for(|done| *done).await;
        info!("process stopped");
    }

    fn log(&self, fd: u32) -> Result<&OutputLog> {
        match fd {
            STDOUT => Ok(self.stdout.as_ref()),
            STDERR => Ok(self.stderr.as_ref()),
            other => Err(Error::invalid(format!("unknown fd {other}"))),
        }
    }

    async fn launch(
        &self,
        path: &Path,
        environ: &[String],
        args: &[String],
    ) -> std::io::Result<Child> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .env_clear()
            .envs(environ.iter().filter_map(|kv| kv.split_once('=')))
            .current_dir(&self.config.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut attempts = 0;
        loop {
            match cmd.spawn() {
                // A concurrent fork may briefly hold the fresh image open for writing.
                Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                result => return result,
            }
        }
    }
}

async fn write_executable(path: &Path, image: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, image).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

fn spawn_pump<R>(log: Arc<OutputLog>, pipe: Option<R>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let generation = log.reopen();
    match pipe {
        Some(pipe) => {
            tokio::spawn(async move { log.pump(generation, pipe).await });
        }
        None => log.close_for(generation),
    }
}

/// Waits for the child (or a kill request), records its outcome, and removes
/// the staged executable.
async fn reap(
    mut child: Child,
    path: PathBuf,
    kill: CancellationToken,
    healthy: Arc<AtomicBool>,
    exited: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    match status {
        Ok(status) if status.success() => info!("process exited successfully"),
        Ok(status) => {
            warn!(code = ?status.code(), "process exited with error");
            healthy.store(false, Ordering::SeqCst);
        }
        Err(err) => {
            error!(error = %err, "failed to wait for process");
            healthy.store(false, Ordering::SeqCst);
        }
    }
    if let Err(err) = tokio::fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %err, "failed to remove executable");
    }
    let _ = exited.send(true);
}

#[async_trait]
impl SupervisorApi for Supervisor {
    async fn set_environ(&self, _ctx: &Context, environ: Vec<String>) -> Result<()> {
        if let Some(bad) = environ.iter().find(|kv| !kv.contains('=')) {
            return Err(Error::invalid(format!("environment entry {bad:?} is not KEY=VALUE")));
        }
        debug!(count = environ.len(), "environment staged");
        self.staging.lock().unwrap_or_else(PoisonError::into_inner).environ = environ;
        Ok(())
    }

    async fn set_args(&self, _ctx: &Context, args: Vec<String>) -> Result<()> {
        debug!(?args, "arguments staged");
        self.staging.lock().unwrap_or_else(PoisonError::into_inner).args = args;
        Ok(())
    }

    async fn set_binary(&self, _ctx: &Context, image: Vec<u8>) -> Result<()> {
        let digest = Digest::of(&image);
        info!(size = image.len(), %digest, "binary staged");
        let mut staging = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
        staging.image = Some(Arc::new(image));
        staging.digest = Some(digest);
        Ok(())
    }

    async fn get_binary(&self, _ctx: &Context) -> Result<Vec<u8>> {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .image
            .as_ref()
            .map(|image| image.as_ref().clone())
            .ok_or_else(|| Error::invalid("no binary set"))
    }

    async fn exec(&self, ctx: &Context, image: Option<Vec<u8>>) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let (image, environ, args) = {
            let staging = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
            let image = match image {
                Some(image) => Arc::new(image),
                None => staging.image.clone().ok_or_else(|| Error::invalid("no binary set"))?,
            };
            (image, staging.environ.clone(), staging.args.clone())
        };

        let mut process = self.process.lock().await;
        if process.as_ref().is_some_and(ProcessHandle::running) {
            return Err(Error::invalid("a process is already running"));
        }

        let path = self.config.workdir.join(format!("workerd-exec-{}", Uuid::new_v4()));
        write_executable(&path, &image)
            .await
            .map_err(|e| Error::remote(format!("stage {}: {e}", path.display())))?;
        let mut child = match self.launch(&path, &environ, &args).await {
            Ok(child) => child,
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(Error::remote(format!("exec {}: {err}", path.display())));
            }
        };
        let pid = child.id();
        info!(pid = ?pid, path = %path.display(), args = ?args, "process started");

        self.healthy.store(true, Ordering::SeqCst);
        spawn_pump(self.stdout.clone(), child.stdout.take());
        spawn_pump(self.stderr.clone(), child.stderr.take());

        let kill = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(reap(child, path, kill.clone(), self.healthy.clone(), exited_tx));
        *process = Some(ProcessHandle {
            pid,
            exited: exited_rx,
            kill,
        });
        Ok(())
    }

    async fn info(&self, _ctx: &Context) -> Result<Info> {
        let digest = self
            .staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .digest
            .clone();
        Ok(Info {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            digest,
        })
    }

    async fn ping(&self, _ctx: &Context, seq: u64) -> Result<u64> {
        Ok(seq)
    }

    async fn keepalive(&self, ctx: &Context, next: Duration) -> Result<KeepaliveReply> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let accepted = next.clamp(self.config.min_keepalive, self.config.max_keepalive);
        self.lease
            .send_replace(Some(Instant::now() + self.config.lease_for(accepted)));
        let healthy = self.healthy();
        debug!(?next, ?accepted, healthy, "keepalive");
        Ok(KeepaliveReply {
            next: accepted,
            healthy,
        })
    }

    async fn tail(&self, ctx: &Context, req: TailRequest) -> Result<TailChunk> {
        self.log(req.fd)?.read(ctx, req.offset).await
    }

    async fn register(&self, _ctx: &Context, spec: ServiceSpec) -> Result<()> {
        let service = registry::decode(&spec)?;
        let service = registry::maybe_init(service, &self.runtime).await?;
        self.services.register(&spec.name, Arc::from(service))?;
        info!(service = %spec.name, kind = %spec.kind, "user service registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ErrorKind;

    fn supervisor() -> Supervisor {
        let mut config = Config {
            min_keepalive: Duration::from_millis(50),
            max_keepalive: Duration::from_secs(5),
            keepalive_grace: Duration::from_millis(10),
            ..Default::default()
        };
        config.apply_defaults();
        Supervisor::new(config, Arc::new(ServiceTable::new()), Runtime::detached())
    }

    #[tokio::test]
    async fn test_get_binary_without_image_is_invalid() {
        let sup = supervisor();
        let err = sup.get_binary(&Context::background()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_set_binary_updates_digest() {
        let sup = supervisor();
        let ctx = Context::background();
        assert_eq!(sup.info(&ctx).await.unwrap().digest, None);
        sup.set_binary(&ctx, b"image".to_vec()).await.unwrap();
        let info = sup.info(&ctx).await.unwrap();
        assert_eq!(info.digest, Some(Digest::of(b"image")));
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(sup.get_binary(&ctx).await.unwrap(), b"image");
    }

    #[tokio::test]
    async fn test_environ_requires_key_value() {
        let sup = supervisor();
        let err = sup
            .set_environ(&Context::background(), vec!["NOEQUALS".into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_keepalive_clamps_interval() {
        let sup = supervisor();
        let ctx = Context::background();
        let low = sup.keepalive(&ctx, Duration::from_millis(1)).await.unwrap();
        assert_eq!(low.next, Duration::from_millis(50));
        assert!(low.healthy);
        let high = sup.keepalive(&ctx, Duration::from_secs(60)).await.unwrap();
        assert_eq!(high.next, Duration::from_secs(5));
        assert!(sup.lease_deadline().is_some());
    }

    #[tokio::test]
    async fn test_keepalive_returns_context_error() {
        let sup = supervisor();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = sup.keepalive(&ctx, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let sup = supervisor();
        sup.keepalive(&Context::background(), Duration::from_millis(100))
            .await
            .unwrap();
        let started = Instant::now();
        sup.lease_expired().await;
        assert!(started.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_tail_rejects_unknown_fd() {
        let sup = supervisor();
        let err = sup
            .tail(&Context::background(), TailRequest { fd: 7, offset: 0 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_exec_without_image_is_invalid() {
        let sup = supervisor();
        let err = sup.exec(&Context::background(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
