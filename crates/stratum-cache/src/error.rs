//! # Design
//!
//! - Constant messages; the key, limit, or path travels in fields.
//! - A failed insertion never leaves a partial entry behind.

use std::io;
use std::path::PathBuf;

use stratum_core::CacheEntryKind;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors produced by the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The entry does not fit even after cleanup.
    #[error("cache resource limit exceeded")]
    ResourceLimitExceeded {
        /// Pool the entry was destined for.
        kind: CacheEntryKind,
        /// Byte budget of that pool.
        limit: u64,
        /// Size of the rejected entry.
        attempted: u64,
    },
    /// The key cannot be stored.
    #[error("invalid cache key")]
    InvalidKey {
        /// Offending key.
        key: String,
        /// Static reason for the rejection.
        reason: &'static str,
    },
    /// Filesystem failures while materialising or evicting.
    #[error("cache io failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Index serialisation failures.
    #[error("cache index failure")]
    Json {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Index path.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

impl CacheError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn limit_error_carries_context() {
        let err = CacheError::ResourceLimitExceeded {
            kind: CacheEntryKind::Archive,
            limit: 100,
            attempted: 160,
        };
        assert_eq!(err.to_string(), "cache resource limit exceeded");
        assert!(matches!(
            err,
            CacheError::ResourceLimitExceeded {
                limit: 100,
                attempted: 160,
                ..
            }
        ));
    }

    #[test]
    fn io_helper_keeps_source() {
        let err = CacheError::io("cache.evict", "/tmp/x", io::Error::other("busy"));
        assert_eq!(err.to_string(), "cache io failure");
        assert!(err.source().is_some());
    }
}
