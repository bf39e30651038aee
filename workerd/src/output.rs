//! Bounded capture of a child's stdout/stderr for `Tail`.

use std::sync::{Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::TailChunk;
use crate::rpc::{Context, Error, Result};

/// Largest chunk returned by a single read.
const MAX_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct Buffer {
    data: Vec<u8>,
    /// Absolute offset of `data[0]`.
    base: u64,
    closed: bool,
    /// Bumped on every [`OutputLog::reopen`]; writers from older generations
    /// are ignored.
    generation: u64,
}

impl Buffer {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn push(&mut self, bytes: &[u8], limit: usize) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > limit {
            let excess = self.data.len() - limit;
            self.data.drain(..excess);
            self.base += excess as u64;
        }
    }
}

/// Append-only byte log that keeps at most `limit` trailing bytes.
///
/// Offsets are absolute, so a reader that falls behind the retained window
/// resumes at the oldest byte still held.
pub struct OutputLog {
    buf: Mutex<Buffer>,
    notify: Notify,
    limit: usize,
}

impl OutputLog {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Mutex::new(Buffer::default()),
            notify: Notify::new(),
            limit: limit.max(1),
        }
    }

    pub fn append(&self, bytes: &[u8]) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes, self.limit);
        self.notify.notify_waiters();
    }

    /// Appends on behalf of `generation`. Returns `false`, dropping the
    /// bytes, once the log has been reopened for a newer writer.
    pub fn append_for(&self, generation: u64, bytes: &[u8]) -> bool {
        {
            let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
            if buf.generation != generation {
                return false;
            }
            buf.push(bytes, self.limit);
        }
        self.notify.notify_waiters();
        true
    }

    /// Marks the stream finished; pending readers see `eof`.
    pub fn close(&self) {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.notify.notify_waiters();
    }

    /// Closes the stream only if `generation` is still the current writer.
    pub fn close_for(&self, generation: u64) {
        {
            let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
            if buf.generation != generation {
                return;
            }
            buf.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Re-opens the log for a new process and returns its writer generation.
    /// Offsets keep increasing.
    pub fn reopen(&self) -> u64 {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        buf.closed = false;
        buf.generation += 1;
        buf.generation
    }

    pub fn end(&self) -> u64 {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).end()
    }

    fn try_read(&self, offset: u64) -> Result<Option<TailChunk>> {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        if offset > buf.end() {
            return Err(Error::invalid(format!(
                "offset {offset} is past the end of the stream ({})",
                buf.end()
            )));
        }
        let start = offset.max(buf.base);
        if start < buf.end() {
            let from = (start - buf.base) as usize;
            let to = buf.data.len().min(from + MAX_CHUNK);
            return Ok(Some(TailChunk {
                data: buf.data[from..to].to_vec(),
                next_offset: buf.base + to as u64,
                eof: false,
            }));
        }
        if buf.closed {
            return Ok(Some(TailChunk {
                data: Vec::new(),
                next_offset: start,
                eof: true,
            }));
        }
        Ok(None)
    }

    /// Long-polls for bytes at or after `offset`.
    pub async fn read(&self, ctx: &Context, offset: u64) -> Result<TailChunk> {
        loop {
            let notified = self.notify.notified();
            if let Some(chunk) = self.try_read(offset)? {
                return Ok(chunk);
            }
            tokio::select! {
                _ = notified => {}
                err = ctx.done() => return Err(err),
            }
        }
    }

    /// Copies `src` into the log until it ends, then closes the log. Stops
    /// early, leaving the log open, once a newer generation takes over.
    pub async fn pump<R: AsyncRead + Unpin>(&self, generation: u64, mut src: R) {
        let mut chunk = [0u8; 8192];
        loop {
            match src.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if !self.append_for(generation, &chunk[..n]) {
                        debug!(generation, "dropping output from a previous process");
                        return;
                    }
                }
            }
        }
        self.close_for(generation);
    }
}
