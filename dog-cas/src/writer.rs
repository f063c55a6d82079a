use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, instrument};

use crate::backend::ObjectBackend;
use crate::pipe::PipeWriter;
use crate::{BackendError, CasError, CasResult, ConfirmConfig};

/// Final outcome of a background upload: stored size, or the backend's error.
pub(crate) type UploadOutcome = Option<Result<u64, Arc<BackendError>>>;

/// Incremental writer returned by [`CasStore::create`](crate::CasStore::create).
///
/// Bytes written here stream to the backend through a background upload.
/// [`close`](Self::close) must be called for the object to be stored; a handle
/// dropped without closing aborts its upload.
pub struct WriteHandle {
    pipe: PipeWriter,
    upload: watch::Receiver<UploadOutcome>,
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    key: String,
    id: String,
    confirm: ConfirmConfig,
    written: u64,
    closed: bool,
}

impl WriteHandle {
    pub(crate) fn new(
        pipe: PipeWriter,
        upload: watch::Receiver<UploadOutcome>,
        backend: Arc<dyn ObjectBackend>,
        bucket: String,
        key: String,
        id: String,
        confirm: ConfirmConfig,
    ) -> Self {
        Self {
            pipe,
            upload,
            backend,
            bucket,
            key,
            id,
            confirm,
            written: 0,
            closed: false,
        }
    }

    /// Backend key the object is written to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Canonical form of the identifier being written
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Confirmation settings captured when the handle was created
    pub fn confirm_config(&self) -> ConfirmConfig {
        self.confirm
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `buf`, waiting while the upload is not keeping up.
    ///
    /// Fails with [`CasError::Upload`] once the background upload has failed,
    /// carrying the backend's error.
    pub async fn write(&mut self, buf: &[u8]) -> CasResult<usize> {
        if self.closed {
            return Err(CasError::AlreadyClosed);
        }
        match self.pipe.write(buf).await {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(err) => match self.upload_error().await {
                Some(source) => Err(CasError::upload(&self.key, source)),
                None => Err(CasError::transfer(&self.key, err)),
            },
        }
    }

    /// Finish the object.
    ///
    /// Seals the pipe so the upload can complete, then, when confirmation is
    /// enabled, polls the backend until the object is visible or the timeout
    /// passes. A second call fails with [`CasError::AlreadyClosed`] and does
    /// nothing else.
    #[instrument(skip(self), fields(key = %self.key, bytes = self.written))]
    pub async fn close(&mut self) -> CasResult<()> {
        if self.closed {
            return Err(CasError::AlreadyClosed);
        }
        self.closed = true;

        let sealed = self.pipe.close();
        if let Some(source) = self.finished_error() {
            return Err(CasError::upload(&self.key, source));
        }
        sealed.map_err(|e| CasError::transfer(&self.key, e))?;

        if !self.confirm.enabled {
            return Ok(());
        }
        self.confirm_visible().await
    }

    /// Race the visibility poller against the timeout; stop the poller either way.
    async fn confirm_visible(&self) -> CasResult<()> {
        let (found_tx, found_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(poll_visible(
            self.backend.clone(),
            self.bucket.clone(),
            self.key.clone(),
            self.confirm.poll_interval,
            self.upload.clone(),
            found_tx,
            done_rx,
        ));

        let outcome = tokio::select! {
            found = found_rx => match found {
                Ok(Ok(())) => {
                    debug!(key = %self.key, "object visible");
                    Ok(())
                }
                Ok(Err(source)) => Err(CasError::upload(&self.key, source)),
                Err(_) => Err(CasError::transfer(
                    &self.key,
                    io::Error::new(io::ErrorKind::Other, "visibility poller stopped unexpectedly"),
                )),
            },
            _ = tokio::time::sleep(self.confirm.timeout) => {
                debug!(key = %self.key, timeout = ?self.confirm.timeout, "visibility confirmation timed out");
                Err(CasError::ConfirmTimeout {
                    id: self.id.clone(),
                    timeout: self.confirm.timeout,
                })
            }
        };

        let _ = done_tx.send(());
        outcome
    }

    /// The upload's error, once it has finished.
    async fn upload_error(&mut self) -> Option<Arc<BackendError>> {
        let outcome = self.upload.wait_for(Option::is_some).await.ok()?;
        outcome_error(&outcome)
    }

    /// The upload's error if it has already failed, without waiting.
    fn finished_error(&self) -> Option<Arc<BackendError>> {
        outcome_error(&self.upload.borrow())
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("key", &self.key)
            .field("written", &self.written)
            .field("closed", &self.closed)
            .finish()
    }
}

fn outcome_error(outcome: &UploadOutcome) -> Option<Arc<BackendError>> {
    match outcome {
        Some(Err(err)) => Some(err.clone()),
        _ => None,
    }
}

/// HEAD the key every `interval` until it is visible, the upload fails, or
/// `done` fires.
async fn poll_visible(
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    key: String,
    interval: Duration,
    upload: watch::Receiver<UploadOutcome>,
    found: oneshot::Sender<Result<(), Arc<BackendError>>>,
    mut done: oneshot::Receiver<()>,
) {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let head = tokio::select! {
            biased;
            _ = &mut done => return,
            head = backend.head_object(&bucket, &key) => head,
        };
        if head.is_ok() {
            debug!(key = %key, attempts, "visibility confirmed");
            let _ = found.send(Ok(()));
            return;
        }
        let failed = outcome_error(&upload.borrow());
        if let Some(err) = failed {
            let _ = found.send(Err(err));
            return;
        }
        tokio::select! {
            biased;
            _ = &mut done => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
