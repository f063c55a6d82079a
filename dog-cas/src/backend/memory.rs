use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::backend::{ObjectBackend, ObjectHead, PutResult};
use crate::{BackendError, ByteStream};

const GET_CHUNK_BYTES: usize = 8 * 1024;

struct StoredObject {
    data: Bytes,
    visible_at: Instant,
    modified: i64,
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn etag(data: &[u8]) -> String {
    blake3::hash(data).to_hex().as_str()[..32].to_string()
}

/// Call counters, for asserting how a store drove its backend
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub heads: AtomicUsize,
    pub gets: AtomicUsize,
    pub puts_started: AtomicUsize,
    pub puts_completed: AtomicUsize,
    pub deletes: AtomicUsize,
}

/// In-memory backend for testing and development.
///
/// It can imitate an eventually consistent object store: with a visibility
/// lag, a stored object only shows up to `head_object`/`get_object` once the
/// lag has passed. Cloning shares the same objects.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
    stats: Arc<MemoryStats>,
    visibility_lag: Duration,
    put_delay: Duration,
    fail_puts: Arc<AtomicBool>,
    hide_heads: Arc<AtomicBool>,
    truncate_gets: Arc<RwLock<Option<usize>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects become visible this long after their put completes
    pub fn with_visibility_lag(mut self, lag: Duration) -> Self {
        self.visibility_lag = lag;
        self
    }

    /// Every put takes at least this long after its body is drained
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    /// Make subsequent puts fail after draining their body
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make `head_object` report every object as missing
    pub fn set_hide_heads(&self, hide: bool) {
        self.hide_heads.store(hide, Ordering::SeqCst);
    }

    /// Make `get_object` streams fail after `bytes` bytes
    pub fn set_truncate_gets(&self, bytes: Option<usize>) {
        *self.truncate_gets.write() = bytes;
    }

    /// Store an object directly, visible immediately
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                visible_at: Instant::now(),
                modified: unix_now(),
            },
        );
    }

    /// Stored bytes regardless of visibility
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    fn visible(&self, bucket: &str, key: &str) -> Option<(Bytes, i64)> {
        let objects = self.objects.read();
        let object = objects.get(&(bucket.to_string(), key.to_string()))?;
        if Instant::now() < object.visible_at {
            return None;
        }
        Some((object.data.clone(), object.modified))
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, BackendError> {
        self.stats.heads.fetch_add(1, Ordering::SeqCst);
        if self.hide_heads.load(Ordering::SeqCst) {
            return Err(BackendError::not_found(bucket, key));
        }
        let (data, modified) = self
            .visible(bucket, key)
            .ok_or_else(|| BackendError::not_found(bucket, key))?;

        Ok(ObjectHead {
            size_bytes: data.len() as u64,
            etag: Some(etag(&data)),
            last_modified: Some(modified),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream, BackendError> {
        self.stats.gets.fetch_add(1, Ordering::SeqCst);
        let (data, _) = self
            .visible(bucket, key)
            .ok_or_else(|| BackendError::not_found(bucket, key))?;
        let truncate = *self.truncate_gets.read();

        let stream = async_stream::stream! {
            let limit = truncate.unwrap_or(data.len()).min(data.len());
            let mut offset = 0;
            while offset < limit {
                let end = (offset + GET_CHUNK_BYTES).min(limit);
                yield Ok(data.slice(offset..end));
                offset = end;
            }
            if truncate.is_some() {
                yield Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
        };
        Ok(Box::pin(stream))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
    ) -> Result<PutResult, BackendError> {
        self.stats.puts_started.fetch_add(1, Ordering::SeqCst);

        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk.map_err(BackendError::other)?);
        }

        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackendError::other(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated put failure",
            )));
        }

        let data = data.freeze();
        let size_bytes = data.len() as u64;
        let etag = etag(&data);
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                visible_at: Instant::now() + self.visibility_lag,
                modified: unix_now(),
            },
        );
        self.stats.puts_completed.fetch_add(1, Ordering::SeqCst);

        Ok(PutResult {
            etag: Some(etag),
            size_bytes,
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError> {
        self.stats.deletes.fetch_add(1, Ordering::SeqCst);
        // deleting a missing key is not an error, same as S3
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::once(async move {
            Ok::<_, std::io::Error>(Bytes::from_static(data))
        }))
    }

    #[tokio::test]
    async fn put_then_get_and_head() {
        let backend = MemoryBackend::new();
        let put = backend.put_object("b", "k", body(b"hello")).await.unwrap();
        assert_eq!(put.size_bytes, 5);

        let head = backend.head_object("b", "k").await.unwrap();
        assert_eq!(head.size_bytes, 5);
        assert_eq!(head.etag, put.etag);

        let data = collect(backend.get_object("b", "k").await.unwrap()).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_lag_hides_fresh_objects() {
        let backend = MemoryBackend::new().with_visibility_lag(Duration::from_secs(1));
        backend.put_object("b", "k", body(b"hello")).await.unwrap();

        assert!(backend.head_object("b", "k").await.unwrap_err().is_not_found());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.head_object("b", "k").await.is_ok());
    }

    #[tokio::test]
    async fn failed_body_stores_nothing() {
        let backend = MemoryBackend::new();
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"half")),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "writer went away")),
        ]));

        assert!(backend.put_object("b", "k", stream).await.is_err());
        assert!(backend.is_empty());
        assert_eq!(backend.stats().puts_completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn truncated_get_errors_after_limit() {
        let backend = MemoryBackend::new();
        backend.insert("b", "k", vec![7u8; 100]);
        backend.set_truncate_gets(Some(10));

        let mut stream = backend.get_object("b", "k").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 10);
        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let backend = MemoryBackend::new();
        backend.delete_object("b", "missing").await.unwrap();
    }
}
