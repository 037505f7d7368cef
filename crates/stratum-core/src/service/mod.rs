//! Traits implemented by operation handlers and storage backends.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cancel::CancelSignal;
use crate::error::{CoreError, CoreResult};
use crate::model::{EntryInfo, OperationOutcome, OperationPayload};

/// Readable byte stream returned by [`StorageCapability::open`].
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable byte sink returned by [`StorageSink::create`].
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Executes operations of the payload variants it accepts.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this handler accepts the payload.
    fn can_handle(&self, payload: &OperationPayload) -> bool;

    /// Run the payload to completion, observing `cancel` between sub-items.
    async fn execute(
        &self,
        payload: &OperationPayload,
        cancel: CancelSignal,
    ) -> anyhow::Result<OperationOutcome>;
}

/// Read access to a storage backend.
#[async_trait]
pub trait StorageCapability: Send + Sync {
    /// List the direct children of `path`.
    async fn list(&self, path: &str) -> CoreResult<Vec<EntryInfo>>;

    /// Describe a single entry.
    async fn info(&self, path: &str) -> CoreResult<EntryInfo>;

    /// Open a file for reading.
    async fn open(&self, path: &str) -> CoreResult<ByteStream>;

    /// Size of the entry in bytes.
    async fn size(&self, path: &str) -> CoreResult<u64> {
        Ok(self.info(path).await?.size)
    }

    /// Whether the entry exists.
    async fn exists(&self, path: &str) -> CoreResult<bool> {
        match self.info(path).await {
            Ok(_) => Ok(true),
            Err(CoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Write access to a storage backend.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Create (or truncate, when `overwrite`) a file and return a writer.
    async fn create(&self, path: &str, overwrite: bool) -> CoreResult<ByteSink>;

    /// Create a directory and its parents.
    async fn create_dir_all(&self, path: &str) -> CoreResult<()>;

    /// Remove a file or directory tree.
    async fn remove(&self, path: &str) -> CoreResult<()> {
        let _ = path;
        Err(CoreError::Unsupported {
            operation: "remove",
        })
    }
}
