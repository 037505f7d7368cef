//! Error types for queue submission and dispatch.
//!
//! # Design
//! - Constant messages; identifiers and kinds travel in fields.
//! - Handler failures keep the handler's `anyhow` chain as their source.

use stratum_core::{CoreError, OperationId, OperationKind, OperationStatus};
use thiserror::Error;

/// Primary error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The payload was rejected at submission.
    #[error("operation payload rejected")]
    Validation {
        /// Field-level validation failure.
        #[source]
        source: CoreError,
    },
    /// No registered handler accepts the payload.
    #[error("no handler found for operation")]
    NoHandlerFound {
        /// Kind of the unroutable payload.
        kind: OperationKind,
    },
    /// The operation is in a state that forbids the request.
    #[error("operation not allowed in its current state")]
    OperationNotAllowed {
        /// Operation identifier.
        operation_id: OperationId,
        /// Current status.
        status: OperationStatus,
    },
    /// The identifier is unknown to the queue.
    #[error("operation not found")]
    NotFound {
        /// Operation identifier.
        operation_id: OperationId,
    },
    /// The selected handler returned an error.
    #[error("operation handler failed")]
    Handler {
        /// Kind of the failed payload.
        kind: OperationKind,
        /// Handler error chain.
        #[source]
        source: anyhow::Error,
    },
}

impl QueueError {
    /// Text recorded as the operation's `error_message`.
    #[must_use]
    pub fn operation_message(&self) -> String {
        match self {
            Self::Handler { source, .. } => format!("{source:#}"),
            Self::NoHandlerFound { kind } => format!("{self}: {kind}"),
            Self::Validation { source } => match source {
                CoreError::InvalidPayload { field, reason, .. } => {
                    format!("{self}: {field} {reason}")
                }
                other => format!("{self}: {other}"),
            },
            other => other.to_string(),
        }
    }
}

/// Convenience alias for queue results.
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn operation_messages_carry_context() {
        let err = QueueError::NoHandlerFound {
            kind: OperationKind::BulkCopy,
        };
        assert_eq!(
            err.operation_message(),
            "no handler found for operation: bulk_copy"
        );

        let err = QueueError::Handler {
            kind: OperationKind::FileTransfer,
            source: anyhow!("disk full").context("copy failed"),
        };
        assert_eq!(err.operation_message(), "copy failed: disk full");

        let err = QueueError::Validation {
            source: CoreError::invalid("archive_ids", "must not be empty"),
        };
        assert_eq!(
            err.operation_message(),
            "operation payload rejected: archive_ids must not be empty"
        );
    }
}
