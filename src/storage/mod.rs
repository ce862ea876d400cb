//! Storage provider abstraction.
//!
//! A provider exposes exactly three operations: upload, download and list.
//! Implementations exist for the local filesystem and S3-compatible object
//! stores; [`retry::RetryingProvider`] layers backoff on top of any of them.
//! Providers are safe for concurrent calls.

pub mod local;
pub mod retry;
pub mod s3;

pub use local::LocalProvider;
pub use retry::{RetryConfig, RetryingProvider};
pub use s3::S3Provider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use crate::error::Result;

/// Streaming body handed to and returned by providers.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// A stored backup object.
#[derive(Debug, Clone)]
pub struct BackupItem {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Stream `body` to the object named `key`. The object must not be
    /// observable until the stream has been fully consumed and committed; a
    /// body that yields an error must fail the upload.
    async fn upload(&self, key: &str, body: BodyReader) -> Result<()>;

    /// Open the object named `key` for streaming reads.
    async fn download(&self, key: &str) -> Result<BodyReader>;

    /// List stored objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>>;
}
