//! Error types for HSM access and staging waits.
//!
//! # Design
//! - Constant messages; the path, endpoint, or status travels in fields.
//! - HTTP transport failures keep the `reqwest` error as their source.

use std::time::Duration;

use thiserror::Error;

/// Primary error type for staging operations.
#[derive(Debug, Error)]
pub enum StagingError {
    /// The file did not come online before the deadline.
    #[error("timeout while waiting for file to be staged")]
    Timeout {
        /// Remote path being staged.
        path: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// The path matched no mount point, or more than one with equal length.
    #[error("path does not resolve to exactly one filesystem")]
    AmbiguousFilesystem {
        /// Remote path being resolved.
        path: String,
        /// Mount points that matched.
        matches: Vec<String>,
    },
    /// The API rejected the credentials.
    #[error("hsm authentication failed")]
    Authentication {
        /// HTTP status returned by the API.
        status: u16,
    },
    /// The API answered with a non-success status.
    #[error("hsm request failed")]
    RemoteService {
        /// Endpoint that failed.
        endpoint: &'static str,
        /// HTTP status returned by the API.
        status: u16,
    },
    /// The request could not be sent or its body could not be read.
    #[error("hsm transport failed")]
    Http {
        /// Endpoint that failed.
        endpoint: &'static str,
        /// Underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },
    /// A response was missing a required field.
    #[error("hsm response malformed")]
    Decode {
        /// Endpoint that answered.
        endpoint: &'static str,
        /// Field that was missing or invalid.
        field: &'static str,
    },
    /// The configuration cannot produce a working client.
    #[error("hsm client misconfigured")]
    Config {
        /// Static reason.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// The wait was cancelled by its caller.
    #[error("staging wait cancelled")]
    Cancelled {
        /// Remote path being staged.
        path: String,
    },
    /// The wrapped storage backend failed.
    #[error("staged storage access failed")]
    Storage {
        /// Underlying storage error.
        #[source]
        source: stratum_core::CoreError,
    },
}

impl StagingError {
    /// Stable label for metrics and logs.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            _ => "error",
        }
    }
}

/// Convenience alias for staging results.
pub type StagingResult<T> = Result<T, StagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        let timeout = StagingError::Timeout {
            path: "/hsm/a.nc".into(),
            waited: Duration::from_secs(3),
        };
        assert_eq!(timeout.outcome(), "timeout");
        assert_eq!(
            StagingError::Cancelled { path: "/x".into() }.outcome(),
            "cancelled"
        );
        assert_eq!(
            StagingError::Authentication { status: 401 }.outcome(),
            "error"
        );
        assert_eq!(
            timeout.to_string(),
            "timeout while waiting for file to be staged"
        );
    }
}
