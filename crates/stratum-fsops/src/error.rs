//! # Design
//!
//! - Constant messages; paths, fields, and identifiers travel in fields.
//! - Collaborator failures (storage, staging, cache) keep their error as the source.
//! - Per-item failures are rendered with `{:#}` into `"<id>: <reason>"` entries.

use std::io;
use std::path::PathBuf;

use stratum_cache::CacheError;
use stratum_core::CoreError;
use stratum_staging::StagingError;
use thiserror::Error;

/// Result type for filesystem operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by transfers, archive handling, and local storage.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// IO failures while interacting with the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Walkdir traversal failures.
    #[error("fsops walkdir failure")]
    Walkdir {
        /// Operation that triggered the walkdir failure.
        operation: &'static str,
        /// Path involved in the walkdir failure.
        path: PathBuf,
        /// Underlying walkdir error.
        source: walkdir::Error,
    },
    /// Zip archive failures.
    #[error("fsops zip failure")]
    Zip {
        /// Operation that triggered the archive failure.
        operation: &'static str,
        /// Path involved in the archive failure.
        path: PathBuf,
        /// Underlying zip error.
        source: zip::result::ZipError,
    },
    /// Globset compilation failures.
    #[error("fsops glob failure")]
    Glob {
        /// Payload field holding the pattern.
        field: &'static str,
        /// Glob pattern that failed to compile.
        pattern: String,
        /// Underlying globset error.
        source: globset::Error,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// Unsupported operation or format.
    #[error("fsops unsupported operation")]
    Unsupported {
        /// Operation that is unsupported.
        operation: &'static str,
        /// Optional value that triggered the unsupported error.
        value: Option<String>,
    },
    /// The destination exists and overwriting was not requested.
    #[error("destination already exists")]
    DestinationExists {
        /// Destination path.
        path: String,
    },
    /// Source and destination digests differ after a copy.
    #[error("checksum mismatch")]
    ChecksumMismatch {
        /// Destination path.
        path: String,
        /// SHA-256 of the source bytes.
        expected: String,
        /// SHA-256 of the destination bytes.
        actual: String,
    },
    /// A payload named a location that is not registered.
    #[error("unknown storage location")]
    UnknownLocation {
        /// Location name.
        name: String,
    },
    /// An archive identifier is not in the catalog.
    #[error("unknown archive")]
    UnknownArchive {
        /// Archive identifier.
        archive_id: String,
    },
    /// The operation was cancelled between items.
    #[error("operation cancelled")]
    Cancelled {
        /// Operation kind label.
        operation: &'static str,
    },
    /// Storage backend failures.
    #[error("storage backend failure")]
    Storage {
        /// Underlying storage error.
        #[from]
        source: CoreError,
    },
    /// Staging a file from tape failed.
    #[error("staging failure")]
    Staging {
        /// Underlying staging error.
        #[from]
        source: StagingError,
    },
    /// Cache admission or materialisation failed.
    #[error("cache failure")]
    Cache {
        /// Underlying cache error.
        #[from]
        source: CacheError,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn walkdir(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: walkdir::Error,
    ) -> Self {
        Self::Walkdir {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn zip(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: zip::result::ZipError,
    ) -> Self {
        Self::Zip {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) const fn glob(field: &'static str, pattern: String, source: globset::Error) -> Self {
        Self::Glob {
            field,
            pattern,
            source,
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Short reason used in `"<id>: <reason>"` failure entries.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::DestinationExists { path } => format!("destination already exists: {path}"),
            Self::ChecksumMismatch { path, .. } => format!("checksum mismatch: {path}"),
            Self::UnknownLocation { name } => format!("unknown storage location: {name}"),
            Self::UnknownArchive { archive_id } => format!("archive not found: {archive_id}"),
            Self::Storage {
                source: CoreError::NotFound { path },
            } => format!("not found: {path}"),
            Self::InvalidInput {
                field,
                reason,
                value,
            } => value.as_ref().map_or_else(
                || format!("{field} {reason}"),
                |value| format!("{field} {reason}: {value}"),
            ),
            Self::Unsupported {
                operation,
                value: Some(value),
            } => format!("{operation} unsupported: {value}"),
            other => other.chained(),
        }
    }

    fn chained(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            message.push_str(": ");
            message.push_str(&err.to_string());
            source = err.source();
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use walkdir::WalkDir;

    #[test]
    fn helpers_build_variants_with_sources() -> anyhow::Result<()> {
        let io_err = FsOpsError::io("read", "path", io::Error::other("disk gone"));
        assert!(matches!(io_err, FsOpsError::Io { .. }));
        assert!(io_err.source().is_some());
        assert_eq!(io_err.reason(), "fsops io failure: disk gone");

        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("missing");
        let walk_error = WalkDir::new(&missing)
            .into_iter()
            .next()
            .and_then(Result::err)
            .ok_or_else(|| anyhow::anyhow!("expected walkdir error"))?;
        let walk_err = FsOpsError::walkdir("walk", &missing, walk_error);
        assert!(walk_err.source().is_some());

        let glob_err = match globset::Glob::new("[") {
            Ok(_) => anyhow::bail!("expected glob error"),
            Err(err) => FsOpsError::glob("include_patterns", "[".into(), err),
        };
        assert!(matches!(glob_err, FsOpsError::Glob { field: "include_patterns", .. }));
        Ok(())
    }

    #[test]
    fn reasons_name_the_offending_item() {
        let exists = FsOpsError::DestinationExists {
            path: "out/a.nc".into(),
        };
        assert_eq!(exists.reason(), "destination already exists: out/a.nc");

        let missing = FsOpsError::from(CoreError::NotFound {
            path: "run/b.nc".into(),
        });
        assert_eq!(missing.reason(), "not found: run/b.nc");

        let unknown = FsOpsError::UnknownArchive {
            archive_id: "a9".into(),
        };
        assert_eq!(unknown.reason(), "archive not found: a9");
    }
}
