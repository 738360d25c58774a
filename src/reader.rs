use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::{codec::MessageDecoder, error::Result};

/// Accumulates bytes from the read half of a channel and yields complete MessagePack values.
///
/// Owned exclusively by the session's read loop, so the buffer needs no locking.
pub struct ByteStreamReader<R> {
    inner: R,
    buf: BytesMut,
    chunk: Vec<u8>,
    decoder: MessageDecoder,
}

impl<R: AsyncRead + Unpin> ByteStreamReader<R> {
    /// Creates a reader that pulls at most `read_buffer_size` bytes per read.
    pub fn new(inner: R, read_buffer_size: usize, decoder: MessageDecoder) -> Self {
        let read_buffer_size = read_buffer_size.max(1);
        Self {
            inner,
            buf: BytesMut::with_capacity(read_buffer_size),
            chunk: vec![0; read_buffer_size],
            decoder,
        }
    }

    /// Performs one read from the channel and appends the bytes to the buffer.
    ///
    /// Returns the number of bytes read; zero means the peer closed the channel. Cancel safe.
    pub async fn fill(&mut self) -> Result<usize> {
        let read = self.inner.read(&mut self.chunk).await?;
        self.buf.extend_from_slice(&self.chunk[..read]);
        trace!(read, buffered = self.buf.len(), "read from channel");
        Ok(read)
    }

    /// Takes the next complete value off the front of the buffer, if there is one.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        self.decoder.decode(&mut self.buf)
    }

    /// Bytes currently held that do not yet form a complete value.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
