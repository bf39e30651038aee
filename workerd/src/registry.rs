//! # Service Registry & Fail-Fast Initialization
//!
//! User services cross the driver → supervisor boundary as a [`ServiceSpec`]:
//! a service name, the type name of the instance, and the instance's encoded
//! state. Services are hosted by the daemon process itself, not by the image
//! it executes, so the driver and the daemon must both link the service type
//! and call [`register`] for it before any spec is exchanged. A daemon that
//! never registered a type rejects its specs with `Registration`:
//!
//! ```text
//! driver                                   supervisor
//! ──────                                   ──────────
//! ServiceSpec::new(name, &svc)             decode(spec)
//!   ├─ type registered?  ── no ──▶ Invalid   ├─ lookup kind ──▶ decoder
//!   └─ bincode(svc)      ── err ─▶ Invalid   └─ decoder(payload) ──▶ Box<dyn Service>
//!                                           maybe_init(svc, runtime)
//!                                             └─ Init::init on a blocking thread;
//!                                                error or panic ──▶ Registration
//! ```
//!
//! Encoding happens before any connection is made, so an unencodable
//! service fails locally and synchronously.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{LazyLock, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::codec;
use crate::rpc::{Error, Result, Service};

type Decoder = fn(&[u8]) -> Result<Box<dyn Service>>;

/// Global service type registry: type name → decoder.
static SERVICE_TYPES: LazyLock<RwLock<HashMap<&'static str, Decoder>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Makes `T` transferable as a service. Idempotent.
pub fn register<T>()
where
    T: Service + Serialize + DeserializeOwned,
{
    fn decoder<T: Service + DeserializeOwned>(bytes: &[u8]) -> Result<Box<dyn Service>> {
        let svc: T = codec::decode(bytes)?;
        Ok(Box::new(svc))
    }
    SERVICE_TYPES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(std::any::type_name::<T>(), decoder::<T>);
}

pub fn is_registered(kind: &str) -> bool {
    SERVICE_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(kind)
}

/// A service instance in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Registered type name of the instance.
    pub kind: String,
    pub payload: Vec<u8>,
}

impl ServiceSpec {
    /// Encodes `instance` for registration under `name`.
    ///
    /// Fails with `Invalid` if `T` was never passed to [`register`] or if its
    /// serialization fails.
    pub fn new<T>(name: &str, instance: &T) -> Result<Self>
    where
        T: Service + Serialize,
    {
        if name.is_empty() || name.contains('.') {
            return Err(Error::invalid(format!("bad service name {name:?}")));
        }
        let kind = std::any::type_name::<T>();
        if !is_registered(kind) {
            return Err(Error::invalid(format!(
                "service type {kind} is not registered; call registry::register::<{kind}>()"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            kind: kind.to_string(),
            payload: codec::encode(instance)?,
        })
    }
}

/// Rebuilds the service instance carried by `spec`.
pub fn decode(spec: &ServiceSpec) -> Result<Box<dyn Service>> {
    let decoder = SERVICE_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(spec.kind.as_str())
        .copied()
        .ok_or_else(|| Error::Registration(format!("unknown service type {}", spec.kind)))?;
    decoder(&spec.payload).map_err(|e| Error::Registration(format!("{}: {e}", spec.name)))
}

/// Handle to the hosting process, given to [`Init::init`].
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Address the hosting RPC server listens on, if known.
    pub local_addr: Option<String>,
    /// Cancelled when the hosting process shuts down.
    pub shutdown: CancellationToken,
}

impl Runtime {
    pub fn new(local_addr: Option<String>, shutdown: CancellationToken) -> Self {
        Self {
            local_addr,
            shutdown,
        }
    }

    /// A runtime not tied to any server.
    pub fn detached() -> Self {
        Self::new(None, CancellationToken::new())
    }
}

/// One-time, synchronous setup hook a service may expose through
/// [`Service::initializer`].
pub trait Init: Send {
    fn init(&mut self, runtime: &Runtime) -> Result<()>;
}

/// Runs the service's init hook, if it has one, on a separate blocking
/// thread. An `Err` or a panic becomes a `Registration` error; the calling
/// process keeps running.
pub async fn maybe_init(service: Box<dyn Service>, runtime: &Runtime) -> Result<Box<dyn Service>> {
    let runtime = runtime.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut service = service;
        if let Some(init) = service.initializer() {
            init.init(&runtime)?;
        }
        Ok::<_, Error>(service)
    })
    .await;

    match joined {
        Ok(Ok(service)) => {
            debug!("service initialized");
            Ok(service)
        }
        Ok(Err(err)) => Err(Error::Registration(format!("init: {err}"))),
        Err(join) if join.is_panic() => {
            let msg = panic_message(join.into_panic());
            warn!(panic = %msg, "service init panicked");
            Err(Error::Registration(format!("init panicked: {msg}")))
        }
        Err(join) => Err(Error::Registration(format!("init aborted: {join}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
