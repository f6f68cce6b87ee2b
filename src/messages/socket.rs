//! Low-level message framing and byte-shuffling helpers shared by the
//! client- and server-facing halves of the proxy.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::Error;
use crate::messages::{CURRENT_MEMORY, MAX_MESSAGE_SIZE};

/// Reads the 1-byte message type and 4-byte length header common to every
/// backend/frontend message after startup, returning the length as declared
/// on the wire (which includes the 4 length bytes themselves, but not the
/// type byte).
pub async fn read_message_header<S>(stream: &mut S) -> Result<(u8, i32), Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let code = stream
        .read_u8()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to read message type: {err}")))?;
    let len = stream
        .read_i32()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to read message length: {err}")))?;
    Ok((code, len))
}

/// Reads the payload of a message whose header (`code`/`len`) has already
/// been read, returning the full raw message (type byte + length + payload).
pub async fn read_message_data<S>(stream: &mut S, code: u8, len: i32) -> Result<BytesMut, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "message length {len} is smaller than the length field itself"
        )));
    }

    let mut message = BytesMut::with_capacity(len as usize + 1);
    message.put_u8(code);
    message.put_i32(len);

    let payload_len = len as usize - std::mem::size_of::<i32>();
    if payload_len > 0 {
        let mut payload = vec![0u8; payload_len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| Error::SocketError(format!("Failed to read message payload: {err}")))?;
        message.put_slice(&payload);
    }

    Ok(message)
}

/// Reads one full message off `stream`, enforcing both the per-message size
/// limit and a process-wide memory admission cap so a burst of oversized
/// messages across many connections can't exhaust memory.
pub async fn read_message<S>(stream: &mut S, max_memory_usage: u64) -> Result<BytesMut, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let (code, len) = read_message_header(stream).await?;

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::MaxMessageSize);
    }

    let reserved = CURRENT_MEMORY.fetch_add(len as i64, Ordering::SeqCst) + len as i64;
    if reserved as u64 > max_memory_usage {
        CURRENT_MEMORY.fetch_sub(len as i64, Ordering::SeqCst);
        return Err(Error::CurrentMemoryUsage);
    }

    let result = read_message_data(stream, code, len).await;
    CURRENT_MEMORY.fetch_sub(len as i64, Ordering::SeqCst);
    result
}

/// Writes a message buffer without flushing, for callers that batch several
/// messages before a single flush.
pub async fn write_all<S>(stream: &mut S, message: &BytesMut) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    stream
        .write_all(message)
        .await
        .map_err(|err| Error::SocketError(format!("Failed to write message: {err}")))
}

/// Writes a message buffer and flushes the stream immediately.
pub async fn write_all_flush<S>(stream: &mut S, message: &BytesMut) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    write_all(stream, message).await?;
    stream
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to flush stream: {err}")))
}

/// Writes a message buffer on a write-only half of a split stream (the admin
/// console and control responses only ever hold the write half).
pub async fn write_all_half<S>(stream: &mut S, message: &BytesMut) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    write_all_flush(stream, message).await
}

/// Copies exactly `remaining` bytes from `reader` to `writer`, used to stream
/// oversized DataRow/CopyData payloads without buffering them in full.
pub async fn proxy_copy_data<R, W>(reader: &mut R, writer: &mut W, remaining: usize) -> Result<(), Error>
where
    R: AsyncRead + std::marker::Unpin,
    W: AsyncWrite + std::marker::Unpin,
{
    let mut remaining = remaining;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buf.len());
        reader
            .read_exact(&mut buf[..to_read])
            .await
            .map_err(|err| Error::SocketError(format!("Failed to stream message data: {err}")))?;
        writer
            .write_all(&buf[..to_read])
            .await
            .map_err(|err| Error::SocketError(format!("Failed to forward streamed data: {err}")))?;
        remaining -= to_read;
    }
    writer
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to flush streamed data: {err}")))
}

/// Same as [`proxy_copy_data`] but bounded by an overall timeout, used while
/// streaming from the server connection (which can stall indefinitely).
pub async fn proxy_copy_data_with_timeout<R, W>(
    duration: Duration,
    reader: &mut R,
    writer: &mut W,
    remaining: usize,
) -> Result<(), Error>
where
    R: AsyncRead + std::marker::Unpin,
    W: AsyncWrite + std::marker::Unpin,
{
    match tokio::time::timeout(duration, proxy_copy_data(reader, writer, remaining)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ProxyTimeout),
    }
}
