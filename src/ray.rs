//! Ray - the duplex bridge between one inbound connection and its outbound
//! handler.
//!
//! A ray carries two independent, bounded byte flows:
//! - the request flow, written by the inbound side and read by the outbound side
//! - the response flow, written by the outbound side and read by the inbound side
//!
//! Neither handler holds a reference to the other. Either side may abort the
//! whole ray, which wakes every blocked reader and writer with
//! [`ProxyError::BridgeAborted`].

use crate::error::{ProxyError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default number of chunks buffered per flow before writers block
pub const DEFAULT_CAPACITY: usize = 16;

/// Default maximum chunk size (16KB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

struct AbortState {
    token: CancellationToken,
    cause: Mutex<Option<String>>,
}

/// Shared abort switch of a ray. Cloning it does not create a new ray.
#[derive(Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AbortState {
                token: CancellationToken::new(),
                cause: Mutex::new(None),
            }),
        }
    }

    /// Abort both flows. Only the first cause is kept.
    pub fn abort(&self, cause: impl Into<String>) {
        {
            let mut guard = self.state.cause.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                *guard = Some(cause.into());
            }
        }
        self.state.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Resolves once the ray has been aborted.
    pub async fn aborted(&self) {
        self.state.token.cancelled().await
    }

    fn error(&self) -> ProxyError {
        let guard = self.state.cause.lock().unwrap_or_else(PoisonError::into_inner);
        ProxyError::BridgeAborted {
            cause: guard.clone().unwrap_or_else(|| "aborted".to_string()),
        }
    }
}

/// Writing end of one flow.
pub struct FlowWriter {
    tx: Option<mpsc::Sender<Bytes>>,
    chunk_size: usize,
    abort: AbortHandle,
}

impl FlowWriter {
    /// Enqueue `data`, waiting while the flow is full.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(self.abort.error());
        }
        let tx = self.tx.as_ref().ok_or(ProxyError::FlowClosed)?;

        let mut data = data.into();
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(self.chunk_size));
            tokio::select! {
                biased;
                _ = self.abort.aborted() => return Err(self.abort.error()),
                sent = tx.send(chunk) => sent.map_err(|_| ProxyError::FlowClosed)?,
            }
        }
        Ok(())
    }

    /// Signal end-of-stream to the reader. Calling it again is a no-op.
    pub fn close(&mut self) {
        self.tx.take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for FlowWriter {
    fn drop(&mut self) {
        // Losing a writer without close() must not look like a clean EOF.
        if self.tx.is_some() && !self.abort.is_aborted() {
            self.abort.abort("flow writer dropped before close");
        }
    }
}

/// Reading end of one flow.
pub struct FlowReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    abort: AbortHandle,
}

impl FlowReader {
    /// Next chunk, or `None` once the writer has closed and everything was read.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.abort.is_aborted() {
            return Err(self.abort.error());
        }
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        tokio::select! {
            biased;
            _ = self.abort.aborted() => Err(self.abort.error()),
            chunk = self.rx.recv() => Ok(chunk),
        }
    }

    /// Byte-stream read into `buf`. Returns 0 on end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.recv().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        } else if self.abort.is_aborted() {
            return Err(self.abort.error());
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    /// Read until the writer closes.
    pub async fn read_to_end(&mut self) -> Result<BytesMut> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.recv().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Create a ray whose flows buffer at most `capacity` chunks of `chunk_size` bytes.
pub fn channel(capacity: usize, chunk_size: usize) -> (InboundRay, OutboundRay) {
    let abort = AbortHandle::new();
    let chunk_size = chunk_size.max(1);
    let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
    let (response_tx, response_rx) = mpsc::channel(capacity.max(1));

    let inbound = InboundRay {
        writer: FlowWriter { tx: Some(request_tx), chunk_size, abort: abort.clone() },
        reader: FlowReader { rx: response_rx, pending: Bytes::new(), abort: abort.clone() },
        abort: abort.clone(),
    };
    let outbound = OutboundRay {
        writer: FlowWriter { tx: Some(response_tx), chunk_size, abort: abort.clone() },
        reader: FlowReader { rx: request_rx, pending: Bytes::new(), abort: abort.clone() },
        abort,
    };
    (inbound, outbound)
}

/// Ray with default sizing.
pub fn default_channel() -> (InboundRay, OutboundRay) {
    channel(DEFAULT_CAPACITY, DEFAULT_CHUNK_SIZE)
}

/// The inbound handler's end: writes requests, reads responses.
pub struct InboundRay {
    writer: FlowWriter,
    reader: FlowReader,
    abort: AbortHandle,
}

impl InboundRay {
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.write(data).await
    }

    pub fn close_write(&mut self) {
        self.writer.close();
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.reader.recv().await
    }

    pub fn abort(&self, cause: impl Into<String>) {
        self.abort.abort(cause);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Split into the response reader and the request writer.
    pub fn split(self) -> (FlowReader, FlowWriter, AbortHandle) {
        (self.reader, self.writer, self.abort)
    }
}

/// The outbound handler's end: reads requests, writes responses.
pub struct OutboundRay {
    writer: FlowWriter,
    reader: FlowReader,
    abort: AbortHandle,
}

impl OutboundRay {
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.write(data).await
    }

    pub fn close_write(&mut self) {
        self.writer.close();
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.reader.recv().await
    }

    pub fn abort(&self, cause: impl Into<String>) {
        self.abort.abort(cause);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Split into the request reader and the response writer.
    pub fn split(self) -> (FlowReader, FlowWriter, AbortHandle) {
        (self.reader, self.writer, self.abort)
    }
}
