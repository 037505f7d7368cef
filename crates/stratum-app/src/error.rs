//! # Design
//!
//! - Centralize bootstrap errors; each wraps the failing crate's error with an
//!   operation tag.
//! - Keep error messages constant while carrying context fields for debugging.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration loading failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: stratum_config::ConfigError,
    },
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: stratum_telemetry::TelemetryError,
    },
    /// The cache could not be opened.
    #[error("cache operation failed")]
    Cache {
        /// Operation identifier.
        operation: &'static str,
        /// Source cache error.
        source: stratum_cache::CacheError,
    },
    /// The staging controller could not be built.
    #[error("staging operation failed")]
    Staging {
        /// Operation identifier.
        operation: &'static str,
        /// Source staging error.
        source: stratum_staging::StagingError,
    },
    /// A payload file was rejected by the queue.
    #[error("queue operation failed")]
    Queue {
        /// Operation identifier.
        operation: &'static str,
        /// Source queue error.
        source: stratum_queue::QueueError,
    },
    /// A payload file could not be parsed.
    #[error("payload file invalid")]
    Payload {
        /// Payload file.
        path: PathBuf,
        /// Source JSON error.
        source: serde_json::Error,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: stratum_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: stratum_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn cache(operation: &'static str, source: stratum_cache::CacheError) -> Self {
        Self::Cache { operation, source }
    }

    pub(crate) const fn staging(
        operation: &'static str,
        source: stratum_staging::StagingError,
    ) -> Self {
        Self::Staging { operation, source }
    }

    pub(crate) const fn queue(operation: &'static str, source: stratum_queue::QueueError) -> Self {
        Self::Queue { operation, source }
    }
}
