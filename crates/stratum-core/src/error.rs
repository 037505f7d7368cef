//! Error types shared by the operation model and storage interfaces.
//!
//! # Design
//! - Constant messages; context travels in fields so logs stay structured.
//! - Storage failures keep the underlying IO error as their source.

use std::io;

use thiserror::Error;

/// Primary error type for model validation and storage access.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A payload or value failed validation.
    #[error("operation payload invalid")]
    InvalidPayload {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A storage entry does not exist.
    #[error("storage entry not found")]
    NotFound {
        /// Path that was looked up.
        path: String,
    },
    /// A storage backend does not implement the requested capability.
    #[error("storage operation not supported")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// A storage backend failed while serving a request.
    #[error("storage operation failed")]
    Storage {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: String,
        /// Underlying IO error.
        source: io::Error,
    },
}

impl CoreError {
    /// Build a validation error without an offending value.
    #[must_use]
    pub const fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidPayload {
            field,
            reason,
            value: None,
        }
    }

    /// Map an IO failure onto a storage error, folding `NotFound` into its own variant.
    #[must_use]
    pub fn storage(operation: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Storage {
                operation,
                path,
                source,
            }
        }
    }
}

/// Convenience alias for core results.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_helper_maps_not_found() {
        let err = CoreError::storage(
            "open",
            "/missing",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, CoreError::NotFound { ref path } if path == "/missing"));

        let err = CoreError::storage("open", "/denied", io::Error::other("denied"));
        assert!(matches!(err, CoreError::Storage { operation: "open", .. }));
        assert_eq!(err.to_string(), "storage operation failed");
    }

    #[test]
    fn invalid_helper_has_no_value() {
        let err = CoreError::invalid("archive_ids", "must not be empty");
        assert!(matches!(
            err,
            CoreError::InvalidPayload {
                field: "archive_ids",
                value: None,
                ..
            }
        ));
    }
}
