use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

use crate::pipe::PipeReader;
use crate::{CasError, CasResult};

/// Incremental reader returned by [`CasStore::open`](crate::CasStore::open).
///
/// Read it with [`tokio::io::AsyncReadExt`]. The object has already been
/// downloaded; a background task feeds it through the pipe in chunks.
pub struct ReadHandle {
    inner: Option<StreamReader<PipeReader, Bytes>>,
    key: String,
    size_bytes: u64,
}

impl ReadHandle {
    pub(crate) fn new(pipe: PipeReader, key: String, size_bytes: u64) -> Self {
        Self {
            inner: Some(StreamReader::new(pipe)),
            key,
            size_bytes,
        }
    }

    /// Backend key the object was read from
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Total size of the object
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Release the read end. Safe whether or not the object was read to the
    /// end; the feeding task stops at its next chunk.
    pub fn close(&mut self) -> CasResult<()> {
        let mut reader = self.inner.take().ok_or(CasError::AlreadyClosed)?;
        reader
            .get_mut()
            .close_with_error(io::Error::new(io::ErrorKind::BrokenPipe, "read handle closed"));
        Ok(())
    }
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("key", &self.key)
            .field("size_bytes", &self.size_bytes)
            .field("closed", &self.inner.is_none())
            .finish()
    }
}

impl AsyncRead for ReadHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read on closed handle",
            ))),
        }
    }
}
