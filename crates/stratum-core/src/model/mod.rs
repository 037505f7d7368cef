//! Operation payloads, snapshots, and queue statistics.
//!
//! # Design
//! - Payloads are a closed enum; handlers advertise which variants they accept.
//! - Snapshots are detached copies so callers never observe queue internals.
//! - Validation happens once, at submission, with field-level errors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_events::OperationStatus;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Opaque identifier assigned by the queue.
pub type OperationId = Uuid;

/// Scheduling priority; higher values are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low = 1,
    /// Default priority.
    #[default]
    Normal = 2,
    /// Ahead of normal work.
    High = 3,
    /// Ahead of everything else.
    Urgent = 4,
}

impl Priority {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(CoreError::InvalidPayload {
                field: "priority",
                reason: "unknown priority",
                value: Some(value.to_string()),
            }),
        }
    }
}

/// Which archive-level action a bulk operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkArchiveKind {
    /// Copy archives to the destination, keeping the source.
    Copy,
    /// Copy archives, then remove the source copy.
    Move,
    /// Unpack archive members into the destination.
    Extract,
}

/// Member filters applied while extracting archives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractFilter {
    /// Glob patterns a member must match; empty means everything.
    pub include_patterns: Vec<String>,
    /// Glob patterns that exclude members; exclusion wins.
    pub exclude_patterns: Vec<String>,
}

impl ExtractFilter {
    /// Whether no filtering is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.include_patterns.is_empty() && self.exclude_patterns.is_empty()
    }
}

/// Largest copy buffer a transfer may request.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

const fn default_parallel_operations() -> usize {
    4
}

const fn default_true() -> bool {
    true
}

/// Copy, move, or extract a set of archives to one destination location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkArchiveOperation {
    /// Archive action to perform.
    pub kind: BulkArchiveKind,
    /// Archive identifiers, resolved to paths by the handler.
    pub archive_ids: Vec<String>,
    /// Named destination location.
    pub destination_location: String,
    /// Optional simulation the archives belong to.
    #[serde(default)]
    pub simulation_id: Option<String>,
    /// Archives processed concurrently within this operation.
    #[serde(default = "default_parallel_operations")]
    pub parallel_operations: usize,
    /// Abort remaining archives after the first failure.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Member filters for extraction.
    #[serde(default)]
    pub extract_filter: ExtractFilter,
}

impl BulkArchiveOperation {
    /// Build a bulk operation with default tuning.
    #[must_use]
    pub fn new(
        kind: BulkArchiveKind,
        archive_ids: Vec<String>,
        destination_location: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            archive_ids,
            destination_location: destination_location.into(),
            simulation_id: None,
            parallel_operations: default_parallel_operations(),
            stop_on_error: false,
            extract_filter: ExtractFilter::default(),
        }
    }
}

/// Move a single file between two named locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Source location name.
    pub source_location: String,
    /// Path inside the source location.
    pub source_path: String,
    /// Destination location name.
    pub dest_location: String,
    /// Path inside the destination location.
    pub dest_path: String,
    /// Replace an existing destination file.
    #[serde(default)]
    pub overwrite: bool,
    /// Compare SHA-256 digests after the copy.
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
    /// Copy buffer size in bytes, at most [`MAX_CHUNK_SIZE`]; handler default when absent.
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// A group of file transfers executed as one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFileTransfer {
    /// Individual transfers.
    pub transfers: Vec<FileTransfer>,
    /// Transfers run concurrently within the batch.
    #[serde(default = "default_parallel_operations")]
    pub parallel_transfers: usize,
    /// Abort remaining transfers after the first failure.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Force checksum verification for every transfer.
    #[serde(default)]
    pub verify_all_checksums: bool,
}

/// Copy a directory tree between two named locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTransfer {
    /// Source location name.
    pub source_location: String,
    /// Directory inside the source location.
    pub source_path: String,
    /// Destination location name.
    pub dest_location: String,
    /// Directory inside the destination location.
    pub dest_path: String,
    /// Descend into subdirectories.
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Replace existing destination files.
    #[serde(default)]
    pub overwrite: bool,
    /// Compare SHA-256 digests after each copy.
    #[serde(default)]
    pub verify_checksums: bool,
    /// Relative-path globs a file must match; empty means everything.
    #[serde(default)]
    pub include_patterns: Vec<String>,
    /// Relative-path globs that exclude files; exclusion wins.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Work item carried by a queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    /// Archive-level copy, move, or extract.
    BulkArchive(BulkArchiveOperation),
    /// Single file transfer.
    FileTransfer(FileTransfer),
    /// Batch of file transfers.
    BatchFileTransfer(BatchFileTransfer),
    /// Directory tree transfer.
    DirectoryTransfer(DirectoryTransfer),
}

/// Coarse operation kind used for routing, logs, and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Bulk archive copy.
    BulkCopy,
    /// Bulk archive move.
    BulkMove,
    /// Bulk archive extraction.
    BulkExtract,
    /// Single file transfer.
    FileTransfer,
    /// Batch file transfer.
    BatchFileTransfer,
    /// Directory transfer.
    DirectoryTransfer,
}

impl OperationKind {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BulkCopy => "bulk_copy",
            Self::BulkMove => "bulk_move",
            Self::BulkExtract => "bulk_extract",
            Self::FileTransfer => "file_transfer",
            Self::BatchFileTransfer => "batch_file_transfer",
            Self::DirectoryTransfer => "directory_transfer",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OperationPayload {
    /// Coarse kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::BulkArchive(op) => match op.kind {
                BulkArchiveKind::Copy => OperationKind::BulkCopy,
                BulkArchiveKind::Move => OperationKind::BulkMove,
                BulkArchiveKind::Extract => OperationKind::BulkExtract,
            },
            Self::FileTransfer(_) => OperationKind::FileTransfer,
            Self::BatchFileTransfer(_) => OperationKind::BatchFileTransfer,
            Self::DirectoryTransfer(_) => OperationKind::DirectoryTransfer,
        }
    }

    /// Number of sub-items reported in the `Started` progress update.
    #[must_use]
    pub fn item_count(&self) -> usize {
        match self {
            Self::BulkArchive(op) => op.archive_ids.len(),
            Self::FileTransfer(_) | Self::DirectoryTransfer(_) => 1,
            Self::BatchFileTransfer(batch) => batch.transfers.len(),
        }
    }

    /// Reject structurally invalid payloads before they are queued.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPayload`] naming the first offending field.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::BulkArchive(op) => {
                if op.archive_ids.is_empty() {
                    return Err(CoreError::invalid("archive_ids", "must not be empty"));
                }
                if let Some(blank) = op.archive_ids.iter().find(|id| id.trim().is_empty()) {
                    return Err(CoreError::InvalidPayload {
                        field: "archive_ids",
                        reason: "must not contain blank identifiers",
                        value: Some(blank.clone()),
                    });
                }
                require_non_blank("destination_location", &op.destination_location)?;
                require_positive("parallel_operations", op.parallel_operations)
            }
            Self::FileTransfer(transfer) => validate_transfer(transfer),
            Self::BatchFileTransfer(batch) => {
                if batch.transfers.is_empty() {
                    return Err(CoreError::invalid("transfers", "must not be empty"));
                }
                require_positive("parallel_transfers", batch.parallel_transfers)?;
                batch.transfers.iter().try_for_each(validate_transfer)
            }
            Self::DirectoryTransfer(dir) => {
                require_non_blank("source_location", &dir.source_location)?;
                require_non_blank("source_path", &dir.source_path)?;
                require_non_blank("dest_location", &dir.dest_location)?;
                require_non_blank("dest_path", &dir.dest_path)
            }
        }
    }
}

fn validate_transfer(transfer: &FileTransfer) -> CoreResult<()> {
    require_non_blank("source_location", &transfer.source_location)?;
    require_non_blank("source_path", &transfer.source_path)?;
    require_non_blank("dest_location", &transfer.dest_location)?;
    require_non_blank("dest_path", &transfer.dest_path)?;
    match transfer.chunk_size {
        Some(0) => Err(CoreError::invalid("chunk_size", "must be positive")),
        Some(size) if size > MAX_CHUNK_SIZE => Err(CoreError::InvalidPayload {
            field: "chunk_size",
            reason: "must not exceed 64 MiB",
            value: Some(size.to_string()),
        }),
        _ => Ok(()),
    }
}

fn require_non_blank(field: &'static str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        Err(CoreError::invalid(field, "must not be empty"))
    } else {
        Ok(())
    }
}

fn require_positive(field: &'static str, value: usize) -> CoreResult<()> {
    if value == 0 {
        Err(CoreError::InvalidPayload {
            field,
            reason: "must be at least 1",
            value: Some(value.to_string()),
        })
    } else {
        Ok(())
    }
}

/// Result reported by a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// Whether the handler considers the operation successful overall.
    pub ok: bool,
    /// Number of failed sub-items.
    pub sub_failures: usize,
    /// Bytes copied, moved, or extracted.
    pub bytes_moved: u64,
    /// Optional human-readable summary.
    pub message: Option<String>,
    /// Identifiers of sub-items that succeeded.
    pub succeeded: Vec<String>,
    /// `id: reason` entries for sub-items that failed.
    pub failed: Vec<String>,
}

impl OperationOutcome {
    /// A successful outcome that moved `bytes_moved` bytes.
    #[must_use]
    pub const fn success(bytes_moved: u64) -> Self {
        Self {
            ok: true,
            sub_failures: 0,
            bytes_moved,
            message: None,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Aggregate per-item results; `ok` is true when nothing failed.
    #[must_use]
    pub fn from_items(succeeded: Vec<String>, failed: Vec<String>, bytes_moved: u64) -> Self {
        Self {
            ok: failed.is_empty(),
            sub_failures: failed.len(),
            bytes_moved,
            message: None,
            succeeded,
            failed,
        }
    }

    /// Attach a summary message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether the queue should record COMPLETED for this outcome.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.ok && self.sub_failures == 0
    }

    /// Message recorded on the operation when the outcome is not a success.
    #[must_use]
    pub fn failure_message(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        if self.failed.is_empty() {
            format!("{} sub-operation(s) failed", self.sub_failures)
        } else {
            self.failed.join("; ")
        }
    }
}

/// Progress notifications delivered to an operation's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Emitted when the operation is dispatched.
    Started {
        /// Operation kind.
        kind: OperationKind,
        /// Number of sub-items in the payload.
        item_count: usize,
    },
    /// Emitted once the operation reaches a terminal state.
    Finished {
        /// Terminal status.
        status: OperationStatus,
        /// Handler outcome when the handler returned one.
        outcome: Option<OperationOutcome>,
        /// Error text for failures.
        error: Option<String>,
        /// Wall-clock time between dispatch and completion.
        duration: Option<Duration>,
    },
}

/// Callback invoked with progress updates; runs outside queue locks.
pub type ProgressCallback = Arc<dyn Fn(OperationId, &ProgressUpdate) + Send + Sync>;

/// Detached view of a queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    /// Queue-assigned identifier.
    pub id: OperationId,
    /// Coarse kind of the payload.
    pub kind: OperationKind,
    /// Payload as submitted.
    pub payload: OperationPayload,
    /// Effective priority.
    pub priority: Priority,
    /// Current status.
    pub status: OperationStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the terminal state was recorded.
    pub completed_at: Option<DateTime<Utc>>,
    /// Handler outcome, when one was returned.
    pub outcome: Option<OperationOutcome>,
    /// Failure text for FAILED operations.
    pub error_message: Option<String>,
    /// Free-form labels used for filtering.
    pub tags: BTreeSet<String>,
    /// Submitting user or system.
    pub owner_id: Option<String>,
}

impl OperationSnapshot {
    /// Time between dispatch and completion; measured against now while running.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().ok()
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Operations known to the queue.
    pub total_operations: usize,
    /// Operations waiting for dispatch.
    pub queued: usize,
    /// Operations in RUNNING.
    pub running: usize,
    /// Worker slots currently occupied, including cancelled operations whose
    /// handler has not returned yet.
    pub in_flight: usize,
    /// Operations in COMPLETED.
    pub completed: usize,
    /// Operations in FAILED.
    pub failed: usize,
    /// Operations in CANCELLED.
    pub cancelled: usize,
    /// Operations that finished successfully since startup.
    pub total_processed: u64,
    /// Operations that failed since startup.
    pub total_failed: u64,
    /// Bytes reported by handlers since startup.
    pub total_bytes_processed: u64,
    /// Whether the scheduler loop is active.
    pub is_processing: bool,
    /// Whether dispatching is paused.
    pub is_paused: bool,
    /// Concurrency bound.
    pub max_concurrent: usize,
    /// Waiting plus occupied slots.
    pub queue_length: usize,
}

/// Which cache pool an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEntryKind {
    /// Whole archive files.
    Archive,
    /// Individual extracted or transferred files.
    File,
}

impl CacheEntryKind {
    /// Stable lowercase label, also the pool label in metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::File => "file",
        }
    }

    /// Subdirectory of the cache root holding materialised entries.
    #[must_use]
    pub const fn directory(self) -> &'static str {
        match self {
            Self::Archive => "archives",
            Self::File => "files",
        }
    }
}

/// Metadata describing one entry exposed by a storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Path relative to the backend root.
    pub path: String,
    /// Size in bytes (zero for directories).
    pub size: u64,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Last modification time when the backend knows it.
    pub modified: Option<DateTime<Utc>>,
    /// Backend-specific attributes.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn transfer() -> FileTransfer {
        FileTransfer {
            source_location: "scratch".into(),
            source_path: "run1/out.nc".into(),
            dest_location: "work".into(),
            dest_path: "out.nc".into(),
            overwrite: false,
            verify_checksum: true,
            chunk_size: None,
        }
    }

    #[test]
    fn priority_orders_and_parses() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!("HIGH".parse::<Priority>().expect("parse"), Priority::High);
        assert!("critical".parse::<Priority>().is_err());
    }

    #[test]
    fn bulk_payload_reports_kind_and_items() {
        let payload = OperationPayload::BulkArchive(BulkArchiveOperation::new(
            BulkArchiveKind::Move,
            vec!["a".into(), "b".into()],
            "tape",
        ));
        assert_eq!(payload.kind(), OperationKind::BulkMove);
        assert_eq!(payload.item_count(), 2);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_archive_list() {
        let payload = OperationPayload::BulkArchive(BulkArchiveOperation::new(
            BulkArchiveKind::Copy,
            Vec::new(),
            "tape",
        ));
        let err = payload.validate().expect_err("empty ids");
        assert!(matches!(
            err,
            CoreError::InvalidPayload {
                field: "archive_ids",
                ..
            }
        ));
    }

    #[test]
    fn validation_rejects_zero_parallelism_and_blank_paths() {
        let mut op = BulkArchiveOperation::new(BulkArchiveKind::Copy, vec!["a".into()], "tape");
        op.parallel_operations = 0;
        assert!(OperationPayload::BulkArchive(op).validate().is_err());

        let mut bad = transfer();
        bad.dest_path = "  ".into();
        let batch = OperationPayload::BatchFileTransfer(BatchFileTransfer {
            transfers: vec![transfer(), bad],
            parallel_transfers: 2,
            stop_on_error: false,
            verify_all_checksums: false,
        });
        let err = batch.validate().expect_err("blank dest");
        assert!(matches!(
            err,
            CoreError::InvalidPayload {
                field: "dest_path",
                ..
            }
        ));
    }

    #[test]
    fn validation_bounds_chunk_size() {
        let single = |chunk_size| {
            OperationPayload::FileTransfer(FileTransfer {
                chunk_size,
                ..transfer()
            })
            .validate()
        };
        assert!(single(None).is_ok());
        assert!(single(Some(MAX_CHUNK_SIZE)).is_ok());
        assert!(single(Some(0)).is_err());
        let err = single(Some(usize::MAX)).expect_err("huge buffer");
        assert!(matches!(
            err,
            CoreError::InvalidPayload {
                field: "chunk_size",
                ..
            }
        ));
    }

    #[test]
    fn payload_deserializes_with_defaults() -> Result<(), serde_json::Error> {
        let payload: OperationPayload = serde_json::from_str(
            r#"{"type":"bulk_archive","kind":"extract","archive_ids":["x"],"destination_location":"work"}"#,
        )?;
        let OperationPayload::BulkArchive(op) = payload else {
            panic!("expected bulk archive payload");
        };
        assert_eq!(op.parallel_operations, 4);
        assert!(!op.stop_on_error);
        assert!(op.extract_filter.is_empty());
        Ok(())
    }

    #[test]
    fn outcome_success_requires_no_sub_failures() {
        assert!(OperationOutcome::success(10).is_success());
        let partial = OperationOutcome::from_items(
            vec!["a".into()],
            vec!["b: missing".into()],
            5,
        );
        assert!(!partial.is_success());
        assert_eq!(partial.sub_failures, 1);
        assert_eq!(partial.failure_message(), "b: missing");

        let flagged = OperationOutcome {
            ok: true,
            sub_failures: 2,
            ..OperationOutcome::default()
        };
        assert!(!flagged.is_success());
        assert_eq!(flagged.failure_message(), "2 sub-operation(s) failed");
    }

    #[test]
    fn snapshot_duration_tracks_dispatch_and_completion() {
        let now = Utc::now();
        let mut snapshot = OperationSnapshot {
            id: Uuid::nil(),
            kind: OperationKind::FileTransfer,
            payload: OperationPayload::FileTransfer(transfer()),
            priority: Priority::Normal,
            status: OperationStatus::Running,
            created_at: now,
            started_at: None,
            completed_at: None,
            outcome: None,
            error_message: None,
            tags: BTreeSet::new(),
            owner_id: None,
        };
        assert_eq!(snapshot.duration(), None);
        snapshot.started_at = Some(now);
        assert!(snapshot.duration().is_some());
        snapshot.completed_at = Some(now + TimeDelta::seconds(3));
        assert_eq!(snapshot.duration(), Some(Duration::from_secs(3)));
    }
}
