use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::backend::ObjectBackend;
use crate::pipe::pipe;
use crate::tracker::TransferTracker;
use crate::{
    BackendError, CasConfig, CasError, CasResult, ConfirmConfig, ContentId, KeyLayout, ReadHandle,
    WriteHandle,
};

/// Content-addressed object store over an [`ObjectBackend`].
///
/// Objects are created once and never overwritten. Every [`create`](Self::create)
/// and [`open`](Self::open) hands its network transfer to a background task;
/// [`close`](Self::close) waits for all of them.
pub struct CasStore {
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    keys: KeyLayout,
    config: CasConfig,
    transfers: TransferTracker,
}

impl CasStore {
    /// Create a store over `backend`, keeping objects in `bucket` under
    /// `prefix` (pass `""` for none), with default configuration.
    pub fn new<B, S, P>(backend: B, bucket: S, prefix: P) -> CasResult<Self>
    where
        B: ObjectBackend + 'static,
        S: Into<String>,
        P: Into<String>,
    {
        Self::with_config(backend, bucket, prefix, CasConfig::default())
    }

    /// Create a store with explicit configuration
    pub fn with_config<B, S, P>(backend: B, bucket: S, prefix: P, config: CasConfig) -> CasResult<Self>
    where
        B: ObjectBackend + 'static,
        S: Into<String>,
        P: Into<String>,
    {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(CasError::invalid("bucket name is required"));
        }
        config.validate()?;

        Ok(Self {
            backend: Arc::new(backend),
            bucket,
            keys: KeyLayout::new(prefix),
            config,
            transfers: TransferTracker::new(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        self.keys.prefix()
    }

    /// Get configuration
    pub fn config(&self) -> &CasConfig {
        &self.config
    }

    /// Mutable configuration. Handles already created keep the settings they
    /// captured.
    pub fn config_mut(&mut self) -> &mut CasConfig {
        &mut self.config
    }

    /// Replace the confirmation settings used by later creates
    pub fn set_confirm(&mut self, confirm: ConfirmConfig) {
        self.config.confirm = confirm;
    }

    /// Number of background transfers still running
    pub fn in_flight(&self) -> usize {
        self.transfers.in_flight()
    }

    /// Backend key an identifier is stored under
    pub fn object_key<I: ContentId + ?Sized>(&self, id: &I) -> String {
        self.keys.object_key(id)
    }

    /// Start writing the object for `id`.
    ///
    /// Fails with [`CasError::AlreadyExists`] if the key is already visible in
    /// the backend. The check is best-effort: two concurrent creates for the
    /// same id can both pass it, and content addressing makes their bytes equal.
    #[instrument(skip_all, fields(bucket = %self.bucket, key = tracing::field::Empty))]
    pub async fn create<I: ContentId + ?Sized>(&self, id: &I) -> CasResult<WriteHandle> {
        let key = self.keys.object_key(id);
        tracing::Span::current().record("key", key.as_str());

        match self.backend.head_object(&self.bucket, &key).await {
            Ok(_) => return Err(CasError::already_exists(key)),
            Err(err) if err.is_not_found() => {}
            Err(err) => debug!(error = %err, "existence check failed, creating anyway"),
        }

        let (writer, reader) = pipe(self.config.pipe_depth);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let backend = self.backend.clone();
        let bucket = self.bucket.clone();
        let task_key = key.clone();
        self.transfers.spawn(async move {
            let outcome = match backend.put_object(&bucket, &task_key, Box::pin(reader)).await {
                Ok(result) => {
                    debug!(key = %task_key, size_bytes = result.size_bytes, "upload finished");
                    Ok(result.size_bytes)
                }
                Err(err) => {
                    warn!(key = %task_key, error = %err, "upload failed");
                    Err(Arc::new(err))
                }
            };
            let _ = outcome_tx.send(Some(outcome));
        });

        Ok(WriteHandle::new(
            writer,
            outcome_rx,
            self.backend.clone(),
            self.bucket.clone(),
            key,
            id.canonical(),
            self.config.confirm,
        ))
    }

    /// Download the object for `id` and return a reader over it.
    ///
    /// The whole object is fetched before this returns; a failed download
    /// reports how many bytes arrived before the error.
    #[instrument(skip_all, fields(bucket = %self.bucket, key = tracing::field::Empty))]
    pub async fn open<I: ContentId + ?Sized>(&self, id: &I) -> CasResult<ReadHandle> {
        let key = self.keys.object_key(id);
        tracing::Span::current().record("key", key.as_str());

        let mut bytes = 0u64;
        let data = match self.download(&key, &mut bytes).await {
            Ok(data) => data.freeze(),
            Err(source) => return Err(CasError::Open { key, bytes, source }),
        };
        let size_bytes = data.len() as u64;

        let (mut writer, reader) = pipe(self.config.pipe_depth);
        let chunk_bytes = self.config.read_chunk_bytes;
        let task_key = key.clone();
        self.transfers.spawn(async move {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + chunk_bytes).min(data.len());
                if let Err(err) = writer.send(data.slice(offset..end)).await {
                    debug!(key = %task_key, error = %err, "reader went away before copy finished");
                    writer.close_with_error(err);
                    return;
                }
                offset = end;
            }
            if let Err(err) = writer.close() {
                debug!(key = %task_key, error = %err, "reader closed with error");
            }
        });

        Ok(ReadHandle::new(reader, key, size_bytes))
    }

    /// Delete the object for `id`. Backend errors are returned as they are.
    #[instrument(skip_all, fields(bucket = %self.bucket, key = tracing::field::Empty))]
    pub async fn remove<I: ContentId + ?Sized>(&self, id: &I) -> CasResult<()> {
        let key = self.keys.object_key(id);
        tracing::Span::current().record("key", key.as_str());

        self.backend.delete_object(&self.bucket, &key).await?;
        debug!("removed");
        Ok(())
    }

    /// Whether the object for `id` is currently visible in the backend
    pub async fn exists<I: ContentId + ?Sized>(&self, id: &I) -> CasResult<bool> {
        let key = self.keys.object_key(id);
        match self.backend.head_object(&self.bucket, &key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Wait for every background transfer started so far to finish.
    ///
    /// Always succeeds; transfer failures are reported on the handle that
    /// owns the transfer. The store stays usable afterwards.
    pub async fn close(&self) -> CasResult<()> {
        let pending = self.transfers.in_flight();
        if pending > 0 {
            info!(bucket = %self.bucket, pending, "waiting for background transfers");
        }
        self.transfers.wait().await;
        Ok(())
    }

    async fn download(&self, key: &str, bytes: &mut u64) -> Result<BytesMut, BackendError> {
        let mut stream = self.backend.get_object(&self.bucket, key).await?;
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(BackendError::other)?;
            *bytes += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}
