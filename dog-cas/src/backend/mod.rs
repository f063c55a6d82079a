use async_trait::async_trait;

use crate::{BackendError, ByteStream};

pub mod memory;
pub mod s3;

/// The four object-storage primitives the store is built on.
///
/// Implementations must be safe to share across concurrent operations; the
/// store never locks around calls into the backend.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Fetch metadata for `bucket/key`, or [`BackendError::NotFound`]
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, BackendError>;

    /// Fetch the object's content as a stream
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream, BackendError>;

    /// Store the object, consuming `body` fully or failing
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> Result<PutResult, BackendError>;

    /// Delete the object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError>;
}

/// Result of a successful put operation
#[derive(Debug, Clone, Default)]
pub struct PutResult {
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Metadata about a stored object
#[derive(Debug, Clone, Default)]
pub struct ObjectHead {
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
}
