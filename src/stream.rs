//! Buffered, timestamped reader and writer over one side of a duplex connection.
//!
//! Every protocol layer reads through a [`Reader`] so that partially consumed
//! input survives a hand-over between layers (HTTP/1 to HTTP/2 after a CONNECT,
//! HTTP/1 to raw TCP after an upgrade).

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::utils::now;
use crate::{Error, Result};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    buf: BytesMut,
    eof: bool,
    first_byte_timestamp: Option<f64>,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buffer(inner, BytesMut::new())
    }

    /// Reader that serves `buffered` before touching `inner`.
    pub fn with_buffer(inner: R, buffered: BytesMut) -> Self {
        Self {
            inner,
            buf: buffered,
            eof: false,
            first_byte_timestamp: None,
            bytes_read: 0,
        }
    }

    /// Timestamp of the first byte received since the last [`reset_timestamps`](Self::reset_timestamps).
    pub fn first_byte_timestamp(&self) -> Option<f64> {
        self.first_byte_timestamp
    }

    pub fn reset_timestamps(&mut self) {
        self.first_byte_timestamp = None;
        if !self.buf.is_empty() {
            // Bytes already waiting belong to the next message.
            self.first_byte_timestamp = Some(now());
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.buf.is_empty()
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }

    /// Pull more bytes from the connection. Returns the number of bytes added.
    async fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.buf.reserve(READ_CHUNK);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.eof = true;
        } else {
            if self.first_byte_timestamp.is_none() {
                self.first_byte_timestamp = Some(now());
            }
            self.bytes_read += n as u64;
        }
        Ok(n)
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(Error::connection_closed(format!(
                    "expected {} bytes, got {}",
                    n,
                    self.buf.len()
                )));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read up to and including the next `\n`, or whatever is left at EOF.
    ///
    /// Fails with [`Error::LineTooLong`] when no newline shows up within `limit` bytes.
    pub async fn read_line(&mut self, limit: usize) -> Result<Bytes> {
        self.read_until(|buf| buf.iter().position(|&b| b == b'\n').map(|i| i + 1), limit)
            .await
    }

    /// Read until `predicate` reports the end offset of the wanted data.
    ///
    /// The predicate sees the whole buffered input and returns `Some(end)` once
    /// the first `end` bytes should be consumed. At EOF the remaining buffer is
    /// returned (which may be empty).
    pub async fn read_until<F>(&mut self, predicate: F, limit: usize) -> Result<Bytes>
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        loop {
            if let Some(end) = predicate(&self.buf) {
                if end > limit {
                    return Err(Error::LineTooLong(limit));
                }
                return Ok(self.buf.split_to(end).freeze());
            }
            if self.buf.len() > limit {
                return Err(Error::LineTooLong(limit));
            }
            if self.fill().await? == 0 {
                let rest = self.buf.split().freeze();
                return Ok(rest);
            }
        }
    }

    /// Read until the peer closes the connection.
    pub async fn read_to_end(&mut self, limit: Option<usize>) -> Result<Bytes> {
        loop {
            if let Some(limit) = limit {
                if self.buf.len() > limit {
                    return Err(Error::body_too_large(format!(
                        "more than {} bytes before connection close",
                        limit
                    )));
                }
            }
            if self.fill().await? == 0 {
                return Ok(self.buf.split().freeze());
            }
        }
    }

    /// Read whatever arrives next (at least one byte unless at EOF).
    pub async fn read_some(&mut self, max: usize) -> Result<Bytes> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let n = self.buf.len().min(max);
        Ok(self.buf.split_to(n).freeze())
    }

    /// Look at the next `n` bytes without consuming them. Shorter at EOF.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8]> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                break;
            }
        }
        let n = n.min(self.buf.len());
        Ok(&self.buf[..n])
    }

    /// Discard `n` already-buffered bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Decode the next item with a `tokio_util` codec, reading as needed.
    ///
    /// Cancel safe: partially received items stay in the buffer.
    pub async fn read_decoded<D>(&mut self, codec: &mut D) -> Result<D::Item>
    where
        D: Decoder<Error = Error>,
    {
        loop {
            if let Some(item) = codec.decode(&mut self.buf)? {
                return Ok(item);
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Err(Error::connection_closed("peer closed connection"));
                }
                return Err(Error::connection_closed(format!(
                    "peer closed connection with {} bytes of a partial frame",
                    self.buf.len()
                )));
            }
        }
    }
}

#[derive(Debug)]
pub struct Writer<W> {
    inner: W,
    buf: BytesMut,
    bytes_written: u64,
    last_write_timestamp: Option<f64>,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            bytes_written: 0,
            last_write_timestamp: None,
        }
    }

    /// Queue bytes; nothing reaches the socket before [`flush`](Self::flush).
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Queue one item through a `tokio_util` encoder.
    pub fn write_encoded<E, T>(&mut self, codec: &mut E, item: T) -> Result<()>
    where
        E: Encoder<T, Error = Error>,
    {
        codec.encode(item, &mut self.buf)
    }

    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let data = self.buf.split();
            self.inner.write_all(&data).await?;
            self.bytes_written += data.len() as u64;
            self.last_write_timestamp = Some(now());
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Write and flush in one go.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.write(data);
        self.flush().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn last_write_timestamp(&self) -> Option<f64> {
        self.last_write_timestamp
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
