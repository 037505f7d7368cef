//! Storage wrapper that stages HSM files before handing out readers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stratum_core::{ByteStream, CancelSignal, CoreError, CoreResult, EntryInfo, StorageCapability};

use crate::controller::StagingController;
use crate::error::{StagingError, StagingResult};

/// Metadata key carrying the HSM block counts in [`EntryInfo::metadata`].
pub const HSM_METADATA_KEY: &str = "hsm";

/// A [`StorageCapability`] whose reads wait for HSM residency.
#[derive(Debug)]
pub struct StagedStorage<S> {
    inner: S,
    controller: Arc<StagingController>,
    stage_before_opening: bool,
    timeout: Option<Duration>,
}

impl<S: StorageCapability> StagedStorage<S> {
    /// Wrap `inner`, staging before every `open`.
    pub const fn new(inner: S, controller: Arc<StagingController>) -> Self {
        Self {
            inner,
            controller,
            stage_before_opening: true,
            timeout: None,
        }
    }

    /// Toggle staging on `open`; when off, reads go straight to the backend.
    #[must_use]
    pub fn stage_before_opening(mut self, enabled: bool) -> Self {
        self.stage_before_opening = enabled;
        self
    }

    /// Override the controller's default staging deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wrapped backend.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Stage (when enabled) and open `path`, honouring `cancel` during the wait.
    ///
    /// # Errors
    ///
    /// Returns staging failures as-is and backend failures as
    /// [`StagingError::Storage`].
    pub async fn open_staged(&self, path: &str, cancel: CancelSignal) -> StagingResult<ByteStream> {
        if self.stage_before_opening {
            self.controller
                .ensure_online(path, self.timeout, cancel)
                .await?;
        }
        self.inner
            .open(path)
            .await
            .map_err(|source| StagingError::Storage { source })
    }
}

#[async_trait]
impl<S: StorageCapability> StorageCapability for StagedStorage<S> {
    async fn list(&self, path: &str) -> CoreResult<Vec<EntryInfo>> {
        self.inner.list(path).await
    }

    async fn info(&self, path: &str) -> CoreResult<EntryInfo> {
        let mut info = self.inner.info(path).await?;
        if !info.is_directory {
            let status = self
                .controller
                .status(path)
                .await
                .map_err(|err| into_core(path, err))?;
            info.metadata.insert(
                HSM_METADATA_KEY.to_string(),
                json!({
                    "online_blocks": status.online_blocks,
                    "offline_blocks": status.offline_blocks,
                    "online": status.is_online(),
                }),
            );
        }
        Ok(info)
    }

    async fn open(&self, path: &str) -> CoreResult<ByteStream> {
        self.open_staged(path, CancelSignal::never())
            .await
            .map_err(|err| into_core(path, err))
    }
}

fn into_core(path: &str, err: StagingError) -> CoreError {
    let kind = match err {
        StagingError::Storage { source } => return source,
        StagingError::Timeout { .. } => io::ErrorKind::TimedOut,
        StagingError::Cancelled { .. } => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    CoreError::Storage {
        operation: "stage",
        path: path.to_string(),
        source: io::Error::new(kind, err),
    }
}
