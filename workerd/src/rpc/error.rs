//! Error taxonomy shared by the RPC client, server, and every remote service.
//!
//! Every failure carries an [`ErrorKind`] so callers can tell transport
//! problems (retryable) apart from failures the remote operation itself
//! reported, and both of those apart from their own cancellation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the transport and the supervisor protocol.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transport/connectivity failure between client and server.
    Net,
    /// Bad argument, undecodable payload, or unknown target.
    Invalid,
    /// The caller's context was cancelled.
    Canceled,
    /// The caller's deadline elapsed.
    DeadlineExceeded,
    /// The remote side does not implement the operation.
    Unsupported,
    /// A service failed to decode or initialize on the remote side.
    Registration,
    /// The machine the call was addressed to has stopped.
    Unavailable,
    /// Any other failure reported by the remote operation.
    Remote,
}

/// Errors produced by the transport and by remote operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Connecting, writing, or reading the connection failed.
    #[error("network error: {0}")]
    Net(String),

    /// Argument or payload was rejected, usually before any I/O happened.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The call's context was cancelled.
    #[error("context canceled")]
    Canceled,

    /// The call's deadline elapsed before a reply arrived.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Operation not implemented by the remote side.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Service registration failed (decode, init error, or init panic).
    #[error("service registration failed: {0}")]
    Registration(String),

    /// The machine has stopped; no further calls are attempted.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Application-level failure reported by the remote operation.
    ///
    /// Displays the remote message verbatim.
    #[error("{0}")]
    Remote(String),
}

impl Error {
    pub fn net(err: impl std::fmt::Display) -> Self {
        Error::Net(err.to_string())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Error::Remote(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Net(_) => ErrorKind::Net,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::Canceled => ErrorKind::Canceled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Registration(_) => ErrorKind::Registration,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Remote(_) => ErrorKind::Remote,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Net => "net",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Canceled => "canceled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Registration => "registration",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Remote => "remote",
        }
    }

    /// Only transport failures are safe to retry blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Net(_))
    }

    /// Message without the kind prefix added by `Display`.
    fn message(&self) -> String {
        match self {
            Error::Net(m)
            | Error::Invalid(m)
            | Error::Unsupported(m)
            | Error::Registration(m)
            | Error::Unavailable(m)
            | Error::Remote(m) => m.clone(),
            Error::Canceled | Error::DeadlineExceeded => self.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Net(err.to_string())
    }
}

/// Out-of-band error carried in a reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for WireError {
    /// A network error raised *inside* a remote operation is not a failure of
    /// this connection, so it crosses the boundary as an application error.
    fn from(err: &Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::Net => ErrorKind::Remote,
            kind => kind,
        };
        WireError {
            kind,
            message: err.message(),
        }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        match wire.kind {
            ErrorKind::Net | ErrorKind::Remote => Error::Remote(wire.message),
            ErrorKind::Invalid => Error::Invalid(wire.message),
            ErrorKind::Canceled => Error::Canceled,
            ErrorKind::DeadlineExceeded => Error::DeadlineExceeded,
            ErrorKind::Unsupported => Error::Unsupported(wire.message),
            ErrorKind::Registration => Error::Registration(wire.message),
            ErrorKind::Unavailable => Error::Unavailable(wire.message),
        }
    }
}
