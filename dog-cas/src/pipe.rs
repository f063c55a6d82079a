//! In-process byte pipe between a caller-facing handle and a background
//! transfer.
//!
//! The pipe is a bounded channel of chunks plus a shared fault slot. Either
//! end may close with an error; the other end observes that error on its
//! next interaction instead of a plain end-of-stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    fault: Mutex<Option<(io::ErrorKind, String)>>,
}

impl Shared {
    fn set_fault(&self, err: &io::Error) {
        let mut fault = self.fault.lock();
        // first error wins
        if fault.is_none() {
            *fault = Some((err.kind(), err.to_string()));
        }
    }

    fn fault(&self) -> Option<io::Error> {
        self.fault
            .lock()
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }
}

/// Create a pipe buffering at most `depth` chunks.
pub(crate) fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let shared = Arc::new(Shared::default());
    (
        PipeWriter {
            tx: Some(tx),
            shared: shared.clone(),
        },
        PipeReader {
            rx,
            shared,
            done: false,
        },
    )
}

/// Write end of a [`pipe`].
///
/// Dropping a writer that was neither closed nor closed with an error poisons
/// the pipe, so the reader never mistakes an abandoned write for a complete one.
pub(crate) struct PipeWriter {
    tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Send `buf` as one chunk, waiting for room in the pipe.
    pub(crate) async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(err) = self.shared.fault() {
            return Err(err);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write on closed pipe"))?;
        if buf.is_empty() {
            return Ok(0);
        }
        tx.send(Bytes::copy_from_slice(buf)).await.map_err(|_| self.broken())?;
        Ok(buf.len())
    }

    /// Send an owned chunk without copying.
    pub(crate) async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write on closed pipe"))?;
        tx.send(chunk).await.map_err(|_| self.broken())
    }

    /// Signal end-of-stream. Fails if the read end already closed with an error.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        self.tx.take();
        match self.shared.fault() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close and make the reader see `err` once buffered chunks are drained.
    pub(crate) fn close_with_error(&mut self, err: io::Error) {
        self.shared.set_fault(&err);
        self.tx.take();
    }

    fn broken(&self) -> io::Error {
        self.shared
            .fault()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "read end of pipe closed"))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.close_with_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe writer dropped before close",
            ));
        }
    }
}

/// Read end of a [`pipe`], consumed as a stream of chunks.
pub(crate) struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    done: bool,
}

impl PipeReader {
    /// Stop accepting chunks; the writer's next write fails with `err`.
    pub(crate) fn close_with_error(&mut self, err: io::Error) {
        self.shared.set_fault(&err);
        self.rx.close();
    }
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(self.shared.fault().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn chunks_arrive_in_order_then_eof() {
        let (mut w, mut r) = pipe(4);
        w.write(b"foo").await.unwrap();
        w.write(b"bar").await.unwrap();
        w.close().unwrap();

        assert_eq!(r.next().await.unwrap().unwrap(), Bytes::from_static(b"foo"));
        assert_eq!(r.next().await.unwrap().unwrap(), Bytes::from_static(b"bar"));
        assert!(r.next().await.is_none());
    }

    #[tokio::test]
    async fn reader_error_reaches_writer() {
        let (mut w, mut r) = pipe(1);
        r.close_with_error(io::Error::new(io::ErrorKind::Other, "upload rejected"));

        let err = w.write(b"data").await.unwrap_err();
        assert_eq!(err.to_string(), "upload rejected");
        assert_eq!(w.close().unwrap_err().to_string(), "upload rejected");
    }

    #[tokio::test]
    async fn writer_error_reaches_reader_after_buffered_chunks() {
        let (mut w, mut r) = pipe(2);
        w.write(b"partial").await.unwrap();
        w.close_with_error(io::Error::new(io::ErrorKind::Other, "copy failed"));

        assert_eq!(r.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert_eq!(r.next().await.unwrap().unwrap_err().to_string(), "copy failed");
        assert!(r.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_writer_poisons_the_pipe() {
        let (w, mut r) = pipe(1);
        drop(w);

        let err = r.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn dropped_reader_breaks_the_writer() {
        let (mut w, r) = pipe(1);
        drop(r);

        let err = w.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
