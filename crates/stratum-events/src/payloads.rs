//! Event payload types carried across the workspace.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Events retained for late readers when no capacity is given.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1_024;

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Accepted and waiting for a free worker slot.
    Queued,
    /// Dispatched to a handler.
    Running,
    /// Handler finished without failures.
    Completed,
    /// Handler failed or reported failed sub-operations.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl OperationStatus {
    /// Stable lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the state can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An operation was accepted by the queue.
    OperationQueued {
        /// Identifier assigned by the queue.
        operation_id: Uuid,
        /// Operation kind label (e.g. `bulk_copy`).
        kind: String,
        /// Priority label.
        priority: String,
    },
    /// An operation was dispatched to a handler.
    OperationStarted {
        /// Identifier of the dispatched operation.
        operation_id: Uuid,
        /// Operation kind label.
        kind: String,
    },
    /// An operation reached a terminal state through its worker.
    OperationFinished {
        /// Identifier of the finished operation.
        operation_id: Uuid,
        /// Terminal state recorded for the operation.
        status: OperationStatus,
        /// Bytes reported by the handler.
        bytes_moved: u64,
        /// Failure or summary message when one was produced.
        message: Option<String>,
    },
    /// An operation was cancelled by a caller.
    OperationCancelled {
        /// Identifier of the cancelled operation.
        operation_id: Uuid,
    },
    /// Dispatching was paused.
    QueuePaused,
    /// Dispatching was resumed.
    QueueResumed,
    /// The scheduler was asked to stop.
    QueueStopped,
    /// A stage request was issued to the HSM.
    StagingRequested {
        /// Absolute path being staged.
        path: String,
        /// Filesystem identifier the path resolved to.
        fsid: String,
    },
    /// A staged file became fully online.
    StagingCompleted {
        /// Absolute path that came online.
        path: String,
        /// Time spent waiting, in milliseconds.
        waited_ms: u64,
    },
    /// Staging did not complete.
    StagingFailed {
        /// Absolute path that failed to stage.
        path: String,
        /// Failure description.
        message: String,
    },
    /// Cache cleanup removed entries.
    CacheEvicted {
        /// Policy label that drove the cleanup.
        policy: String,
        /// Number of entries removed.
        entries_removed: usize,
        /// Bytes reclaimed.
        bytes_removed: u64,
    },
}

impl Event {
    /// Machine-friendly discriminator for log and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OperationQueued { .. } => "operation_queued",
            Self::OperationStarted { .. } => "operation_started",
            Self::OperationFinished { .. } => "operation_finished",
            Self::OperationCancelled { .. } => "operation_cancelled",
            Self::QueuePaused => "queue_paused",
            Self::QueueResumed => "queue_resumed",
            Self::QueueStopped => "queue_stopped",
            Self::StagingRequested { .. } => "staging_requested",
            Self::StagingCompleted { .. } => "staging_completed",
            Self::StagingFailed { .. } => "staging_failed",
            Self::CacheEvicted { .. } => "cache_evicted",
        }
    }

    /// Operation the event concerns, if any.
    #[must_use]
    pub const fn operation_id(&self) -> Option<Uuid> {
        match self {
            Self::OperationQueued { operation_id, .. }
            | Self::OperationStarted { operation_id, .. }
            | Self::OperationFinished { operation_id, .. }
            | Self::OperationCancelled { operation_id } => Some(*operation_id),
            _ => None,
        }
    }
}

/// An event stamped with its sequence number and publication time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequence number, starting at 1.
    pub id: EventId,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    pub event: Event,
}
