//! # RPC Transport
//!
//! A generic request/reply channel keyed by `"Service.Method"`.
//!
//! # Message Format
//!
//! **Request**: `{ method: "Supervisor.Ping", timeout_ms: Some(9875), body: bincode(arg) }`
//!
//! **Response**: `{ result: Ok(bincode(reply)) }` or
//! `{ result: Err({ kind: Invalid, message: "no binary set" }) }`
//!
//! # Modules
//!
//! - [`context`]: deadline + cancellation carried by every call
//! - [`client`]: [`Client`] and the pluggable [`Dialer`]
//! - [`server`]: [`Server`], [`ServiceTable`] and the [`Service`] trait
//! - [`codec`]: framing and payload encoding
//! - [`error`]: the error taxonomy shared by both sides

pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod server;

pub use client::{Client, Connection, Dialer, TcpDialer};
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use server::{Server, Service, ServiceTable};
