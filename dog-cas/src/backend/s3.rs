use std::env;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::BytesMut;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::backend::{ObjectBackend, ObjectHead, PutResult};
use crate::{BackendError, ByteStream, CasError, CasResult};

/// Smallest part S3 accepts for any but the last part of a multipart upload
pub const MIN_PART_BYTES: usize = 5 * 1024 * 1024;

/// S3 connection settings
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, RustFS, ...)
    pub endpoint_url: Option<String>,
    /// Static credentials; the default provider chain is used when unset
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    /// Upload part size. Payloads up to this size go out as a single PutObject.
    pub part_size: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            part_size: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl S3Config {
    /// Read `DOG_CAS_S3_REGION` (required), `DOG_CAS_S3_ENDPOINT_URL`,
    /// `DOG_CAS_S3_ACCESS_KEY_ID`, `DOG_CAS_S3_SECRET_ACCESS_KEY`,
    /// `DOG_CAS_S3_FORCE_PATH_STYLE` and `DOG_CAS_S3_PART_SIZE`.
    pub fn from_env() -> CasResult<Self> {
        fn get_env(key: &str) -> Option<String> {
            env::var(key).ok().filter(|v| !v.is_empty())
        }

        let region = get_env("DOG_CAS_S3_REGION")
            .ok_or_else(|| CasError::invalid("DOG_CAS_S3_REGION environment variable required"))?;

        let mut config = Self {
            region,
            endpoint_url: get_env("DOG_CAS_S3_ENDPOINT_URL"),
            access_key_id: get_env("DOG_CAS_S3_ACCESS_KEY_ID"),
            secret_access_key: get_env("DOG_CAS_S3_SECRET_ACCESS_KEY"),
            ..Self::default()
        };

        if let Some(value) = get_env("DOG_CAS_S3_FORCE_PATH_STYLE") {
            config.force_path_style = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(value) = get_env("DOG_CAS_S3_PART_SIZE") {
            config.part_size = value
                .parse()
                .map_err(|_| CasError::invalid(format!("DOG_CAS_S3_PART_SIZE must be a byte count, got {:?}", value)))?;
        }

        Ok(config)
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret_access_key: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    pub fn with_path_style(mut self) -> Self {
        self.force_path_style = true;
        self
    }

    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes;
        self
    }
}

/// [`ObjectBackend`] over the AWS SDK, for S3 and S3-compatible stores.
///
/// Uploads never hold more than one part in memory: the body is cut into
/// `part_size` parts and sent as a multipart upload once it outgrows a single
/// part.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    part_size: usize,
}

impl S3Backend {
    /// Wrap an already configured client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            part_size: S3Config::default().part_size,
        }
    }

    /// Build a client from `config`
    pub async fn from_config(config: S3Config) -> Self {
        let client = Self::create_client(&config).await;
        Self::new(client).with_part_size(config.part_size)
    }

    /// Build a client from `DOG_CAS_S3_*` environment variables
    pub async fn from_env() -> CasResult<Self> {
        let config = S3Config::from_env()?;
        Ok(Self::from_config(config).await)
    }

    /// Set the part size, raised to [`MIN_PART_BYTES`] if smaller
    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes.max(MIN_PART_BYTES);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    async fn create_client(config: &S3Config) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "dog-cas",
            );
            loader = loader.credentials_provider(credentials);
        }
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url.clone());
        }

        let sdk_config = loader.load().await;
        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(config.force_path_style)
                .build(),
        )
    }

    fn map_aws_error<E>(bucket: &str, key: &str, err: SdkError<E, HttpResponse>) -> BackendError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let status_404 = err
            .raw_response()
            .map(|r| r.status().as_u16() == 404)
            .unwrap_or(false);
        let missing_code = matches!(err.code(), Some("NoSuchKey") | Some("NotFound"));

        if status_404 || missing_code {
            BackendError::not_found(bucket, key)
        } else {
            BackendError::other(err)
        }
    }

    async fn put_single(&self, bucket: &str, key: &str, data: BytesMut) -> Result<PutResult, BackendError> {
        let size_bytes = data.len() as u64;
        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(size_bytes as i64)
            .body(AwsByteStream::from(data.freeze()))
            .send()
            .await
            .map_err(|e| Self::map_aws_error(bucket, key, e))?;

        Ok(PutResult {
            etag: result.e_tag().map(str::to_string),
            size_bytes,
        })
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        first: BytesMut,
        body: &mut ByteStream,
    ) -> Result<PutResult, BackendError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_aws_error(bucket, key, e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| {
                BackendError::other(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "create_multipart_upload returned no upload id",
                ))
            })?
            .to_string();

        debug!(bucket, key, upload_id = %upload_id, "started multipart upload");

        match self.upload_parts(bucket, key, &upload_id, first, body).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = abort {
                    warn!(bucket, key, upload_id = %upload_id, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: BytesMut,
        body: &mut ByteStream,
    ) -> Result<PutResult, BackendError> {
        let mut parts = Vec::new();
        let mut size_bytes = 0u64;
        let mut part_number = 1i32;
        let mut buf = first;
        let mut exhausted = false;

        loop {
            if !buf.is_empty() {
                size_bytes += buf.len() as u64;
                let part = buf.split().freeze();
                let uploaded = self
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(AwsByteStream::from(part))
                    .send()
                    .await
                    .map_err(|e| Self::map_aws_error(bucket, key, e))?;

                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(uploaded.e_tag().map(str::to_string))
                        .build(),
                );
                part_number += 1;
            }
            if exhausted {
                break;
            }
            exhausted = fill_part(body, &mut buf, self.part_size).await?;
        }

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| Self::map_aws_error(bucket, key, e))?;

        debug!(bucket, key, parts = part_number - 1, size_bytes, "completed multipart upload");

        Ok(PutResult {
            etag: completed.e_tag().map(str::to_string),
            size_bytes,
        })
    }
}

/// Pull chunks into `buf` until it holds `part_size` bytes.
/// Returns `true` once the body is exhausted.
async fn fill_part(body: &mut ByteStream, buf: &mut BytesMut, part_size: usize) -> Result<bool, BackendError> {
    while buf.len() < part_size {
        match body.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk.map_err(BackendError::other)?),
            None => return Ok(true),
        }
    }
    Ok(false)
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, BackendError> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_aws_error(bucket, key, e))?;

        Ok(ObjectHead {
            size_bytes: head.content_length().unwrap_or_default().max(0) as u64,
            etag: head.e_tag().map(str::to_string),
            last_modified: head.last_modified().map(|t| t.secs()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream, BackendError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_aws_error(bucket, key, e))?;

        let mut body = output.body;
        let stream = async_stream::stream! {
            loop {
                match body.try_next().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                        break;
                    }
                }
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
        let mut first = BytesMut::new();
        if fill_part(&mut body, &mut first, self.part_size).await? {
            self.put_single(bucket, key, first).await
        } else {
            self.put_multipart(bucket, key, first, &mut body).await
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_aws_error(bucket, key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunks(sizes: &[usize]) -> ByteStream {
        let items: Vec<std::io::Result<Bytes>> = sizes.iter().map(|n| Ok(Bytes::from(vec![1u8; *n]))).collect();
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn fill_part_reports_exhaustion_for_small_bodies() {
        let mut body = chunks(&[3, 4]);
        let mut buf = BytesMut::new();
        assert!(fill_part(&mut body, &mut buf, 16).await.unwrap());
        assert_eq!(buf.len(), 7);
    }

    #[tokio::test]
    async fn fill_part_stops_at_part_size() {
        let mut body = chunks(&[8, 8, 8]);
        let mut buf = BytesMut::new();
        assert!(!fill_part(&mut body, &mut buf, 16).await.unwrap());
        assert_eq!(buf.len(), 16);

        buf.clear();
        assert!(fill_part(&mut body, &mut buf, 16).await.unwrap());
        assert_eq!(buf.len(), 8);
    }

    #[tokio::test]
    async fn fill_part_surfaces_body_errors() {
        let mut body: ByteStream = Box::pin(futures::stream::iter(vec![Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "writer went away",
        ))]));
        let mut buf = BytesMut::new();
        let err = fill_part(&mut body, &mut buf, 16).await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn builder_sets_connection_fields() {
        let config = S3Config::default()
            .with_region("eu-west-1")
            .with_endpoint("http://127.0.0.1:9000")
            .with_credentials("id", "secret")
            .with_path_style();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.endpoint_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert!(config.force_path_style);
        assert_eq!(config.access_key_id.as_deref(), Some("id"));
    }
}
