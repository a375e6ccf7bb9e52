use crate::error::{ProxyError, Result};
use crate::ray::{AbortHandle, FlowReader, FlowWriter};
use bytes::BytesMut;
use futures::future::try_join;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer size for socket -> ray copies (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Relay a socket against the two flows of a ray until both directions finish.
///
/// Bytes read from `stream` go into `writer`; bytes from `reader` are written
/// to `stream`. EOF on either source is propagated as a half-close. Any error
/// aborts the ray so the peer handler is woken up.
pub async fn relay_stream<S>(
    stream: S,
    reader: FlowReader,
    writer: FlowWriter,
    abort: AbortHandle,
    peer: &str,
) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (stream_read, stream_write) = split(stream);

    let upstream = pump_into_flow(stream_read, writer, abort.clone(), peer);
    let downstream = drain_flow(reader, stream_write, abort, peer);

    match try_join(upstream, downstream).await {
        Ok((sent, received)) => {
            log::debug!("Relay with {} completed: {} bytes in, {} bytes out", peer, sent, received);
            Ok((sent, received))
        }
        Err(e) => {
            log::debug!("Relay with {} ended: {}", peer, e);
            Err(e)
        }
    }
}

/// Copy `source` into a flow, closing the flow on EOF.
pub async fn pump_into_flow<R>(mut source: R, mut writer: FlowWriter, abort: AbortHandle, peer: &str) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let result = async {
        let mut buffer = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
        let mut total_bytes = 0u64;

        loop {
            buffer.reserve(RELAY_BUFFER_SIZE);
            let bytes_read = source.read_buf(&mut buffer).await?;
            if bytes_read == 0 {
                log::debug!("{} -> ray: source closed, total bytes: {}", peer, total_bytes);
                writer.close();
                break;
            }
            total_bytes += bytes_read as u64;
            writer.write(buffer.split().freeze()).await?;
        }
        Ok::<u64, ProxyError>(total_bytes)
    }
    .await;

    if let Err(e) = &result {
        abort.abort(format!("{} -> ray: {}", peer, e));
    }
    result
}

/// Copy a flow into `dest`, shutting down `dest` once the flow ends.
pub async fn drain_flow<W>(mut reader: FlowReader, mut dest: W, abort: AbortHandle, peer: &str) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        let mut total_bytes = 0u64;
        while let Some(chunk) = reader.recv().await? {
            dest.write_all(&chunk).await?;
            total_bytes += chunk.len() as u64;
        }
        if let Err(e) = dest.shutdown().await {
            log::debug!("ray -> {}: shutdown failed: {}", peer, e);
        }
        log::debug!("ray -> {}: flow closed, total bytes: {}", peer, total_bytes);
        Ok::<u64, ProxyError>(total_bytes)
    }
    .await;

    if let Err(e) = &result {
        abort.abort(format!("ray -> {}: {}", peer, e));
    }
    result
}
