//! # Wire Codec
//!
//! Payloads and envelopes are bincode-encoded (fixed-width integers, size
//! limit enforced on decode). Each envelope travels as one frame:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ len: u32 BE  │ bincode(Request | Response)  │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! A frame whose declared length exceeds [`MAX_FRAME_SIZE`] is rejected before
//! any buffer is allocated for it.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{Error, Result, WireError};

/// Maximum frame size (512 MiB). Large enough to stage a statically linked
/// binary in one `SetBinary` call.
pub const MAX_FRAME_SIZE: u64 = 512 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encodes an argument or reply. Failure is a local `Invalid` error.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    options()
        .serialize(value)
        .map_err(|e| Error::invalid(format!("encode: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| Error::invalid(format!("decode: {e}")))
}

/// A call envelope: target, remaining time budget, and encoded argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// `"Service.Method"`
    pub method: String,
    /// Milliseconds left on the caller's deadline, if it has one.
    pub timeout_ms: Option<u64>,
    pub body: Vec<u8>,
}

/// Either the encoded reply or an out-of-band error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub result: std::result::Result<Vec<u8>, WireError>,
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = encode(value)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::invalid(format!("frame too large: {} bytes", bytes.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if u64::from(len) > MAX_FRAME_SIZE {
        return Err(Error::net(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    // A frame that arrived intact but does not decode is a protocol mismatch.
    options()
        .deserialize(&buf)
        .map_err(|e| Error::net(format!("malformed frame: {e}")))
}
