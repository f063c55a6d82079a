//! # dog-cas: Content-addressed object storage for DogRS
//!
//! `dog-cas` stores opaque payloads in an S3-compatible bucket, keyed by a
//! content identifier. Objects are written once and never overwritten, and a
//! finished write can wait until the backend actually serves the object.
//!
//! ## Key Features
//!
//! - **Streaming both ways**: write through a [`WriteHandle`] while the upload runs in
//!   the background; read through a [`ReadHandle`] that implements `AsyncRead`
//! - **Create-once**: `create` refuses identifiers that are already stored
//! - **Visibility confirmation**: closing a writer polls the backend until the object
//!   shows up, bridging eventually consistent stores
//! - **Graceful shutdown**: `close` on the store waits for every background transfer
//! - **Storage agnostic**: anything implementing [`ObjectBackend`] works; S3 and
//!   in-memory backends are included
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_cas::prelude::*;
//! use tokio::io::AsyncReadExt;
//!
//! # #[tokio::main]
//! # async fn main() -> CasResult<()> {
//! let store = CasStore::new(MemoryBackend::new(), "my-bucket", "objects")?;
//!
//! // 1. Write an object under its content identifier
//! let id = ContentDigest::identify(b"foobar");
//! let mut writer = store.create(&id).await?;
//! writer.write(b"foobar").await?;
//! writer.close().await?; // returns once the object is visible
//!
//! // 2. Read it back
//! let mut reader = store.open(&id).await?;
//! let mut data = Vec::new();
//! reader.read_to_end(&mut data).await?;
//! assert_eq!(data, b"foobar");
//!
//! // 3. Remove it and shut down
//! store.remove(&id).await?;
//! store.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  WriteHandle /  │  ← caller streams bytes in or out
//! │   ReadHandle    │
//! ├─────────────────┤
//! │      pipe       │  ← bounded, backpressured, errors travel both ways
//! ├─────────────────┤
//! │    CasStore     │  ← keys, create-once check, background transfers
//! ├─────────────────┤
//! │ ObjectBackend   │  ← head / get / put / delete
//! └─────────────────┘
//! ```
//!
//! Confirmation is advisory to the writer: a reader may see an object before
//! its writer's confirmation finishes, or miss it until then.

pub mod backend;
mod config;
mod error;
mod pipe;
mod reader;
mod store;
mod tracker;
mod types;
mod writer;

// Re-export main types for clean API
pub use backend::memory::{MemoryBackend, MemoryStats};
pub use backend::s3::{S3Backend, S3Config};
pub use backend::{ObjectBackend, ObjectHead, PutResult};
pub use config::{CasConfig, ConfirmConfig};
pub use error::{BackendError, CasError, CasResult};
pub use reader::ReadHandle;
pub use store::CasStore;
pub use types::{ByteStream, ContentDigest, ContentId, KeyLayout};
pub use writer::WriteHandle;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CasConfig, CasError, CasResult, CasStore, ConfirmConfig, ContentDigest, ContentId,
        MemoryBackend, ObjectBackend, ReadHandle, WriteHandle,
    };
}
