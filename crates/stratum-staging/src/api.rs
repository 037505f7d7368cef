//! Seam between the staging controller and the HSM REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StagingResult;

/// A filesystem known to the HSM and the mount point it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    /// HSM identifier passed back on every per-file call.
    pub fsid: String,
    /// Absolute mount point.
    pub mount: String,
}

impl Filesystem {
    /// Convenience constructor.
    #[must_use]
    pub fn new(fsid: impl Into<String>, mount: impl Into<String>) -> Self {
        Self {
            fsid: fsid.into(),
            mount: mount.into(),
        }
    }
}

/// Block residency of one file. `None` means the API left the count blank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    /// Blocks resident on disk.
    pub online_blocks: Option<u64>,
    /// Blocks only on tape.
    pub offline_blocks: Option<u64>,
}

impl BlockStatus {
    /// Build from the `/file` response body, accepting numbers, numeric strings, or `""`.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        Self {
            online_blocks: block_count(value.get("onlineblocks")),
            offline_blocks: block_count(value.get("offlineblocks")),
        }
    }

    /// Every block is resident and at least one block exists.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online_blocks.unwrap_or(0) > 0 && self.offline_blocks.unwrap_or(0) == 0
    }
}

fn block_count(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Calls the staging controller needs from an HSM backend.
#[async_trait]
pub trait HsmApi: Send + Sync {
    /// `GET /filesystems`.
    async fn filesystems(&self) -> StagingResult<Vec<Filesystem>>;

    /// `GET /file?fsid=&path=`.
    async fn file_status(&self, fsid: &str, path: &str) -> StagingResult<BlockStatus>;

    /// `POST /request/{command}?fsid=&path=`.
    async fn request(&self, command: &str, fsid: &str, path: &str) -> StagingResult<()>;

    /// `GET /queues`, returned verbatim.
    async fn queues(&self) -> StagingResult<Value>;
}
