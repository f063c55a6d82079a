use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type for store operations
pub type CasResult<T> = Result<T, CasError>;

/// Errors reported by an [`ObjectBackend`](crate::ObjectBackend) primitive.
///
/// Only "not found" is classified; everything else is carried verbatim so
/// callers can downcast to the backend's own error type.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("{source}")]
    Other {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    /// Create a backend error from any error type
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other {
            source: Box::new(error),
        }
    }

    /// Create a not found error for `bucket/key`
    pub fn not_found<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum CasError {
    /// Create found an object already stored under the key.
    #[error("object already exists: {key}")]
    AlreadyExists { key: String },

    /// Open could not download the object.
    #[error("failed to open {key} ({bytes} bytes read): {source}")]
    Open {
        key: String,
        bytes: u64,
        #[source]
        source: BackendError,
    },

    /// The object did not become visible before the confirmation window
    /// closed. The upload itself may still have succeeded.
    #[error("object {id} not visible after {timeout:?}")]
    ConfirmTimeout { id: String, timeout: Duration },

    #[error("already closed")]
    AlreadyClosed,

    /// The backend rejected an upload; the backend's own error is kept.
    #[error("upload of {key} failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: Arc<BackendError>,
    },

    /// A background transfer failed; surfaced on the handle that owns it.
    #[error("transfer of {key} failed: {source}")]
    Transfer {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend error: {source}")]
    Backend {
        #[from]
        source: BackendError,
    },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl CasError {
    /// Create an already exists error
    pub fn already_exists<S: Into<String>>(key: S) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a transfer error for `key`
    pub fn transfer<S: Into<String>>(key: S, source: std::io::Error) -> Self {
        Self::Transfer {
            key: key.into(),
            source,
        }
    }

    /// Create an upload error for `key`
    pub fn upload<S: Into<String>>(key: S, source: Arc<BackendError>) -> Self {
        Self::Upload {
            key: key.into(),
            source,
        }
    }

    /// The backend error behind this error, if there is one
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Open { source, .. } | Self::Backend { source } => Some(source),
            Self::Upload { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// True when the wrapped backend error is a not-found.
    pub fn is_not_found(&self) -> bool {
        match self.backend_error() {
            Some(source) => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_confirm_timeout(&self) -> bool {
        matches!(self, Self::ConfirmTimeout { .. })
    }
}
