//! Filesystem fixtures and payload builders.

use std::fs;
use std::path::{Path, PathBuf};

use stratum_core::{BulkArchiveKind, BulkArchiveOperation, FileTransfer, OperationPayload};
use tempfile::TempDir;

/// Create a fresh temporary directory removed on drop.
///
/// # Errors
///
/// Returns an error when the directory cannot be created.
pub fn temp_dir() -> anyhow::Result<TempDir> {
    Ok(tempfile::Builder::new().prefix("stratum-test-").tempdir()?)
}

/// Write `bytes` to `root/relative`, creating parent directories.
///
/// # Errors
///
/// Returns an error when a directory or the file cannot be written.
pub fn write_file(root: &Path, relative: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    Ok(path)
}

/// Bulk archive payload over `ids` targeting `destination`.
#[must_use]
pub fn bulk_archive(kind: BulkArchiveKind, ids: &[&str], destination: &str) -> OperationPayload {
    OperationPayload::BulkArchive(BulkArchiveOperation::new(
        kind,
        ids.iter().map(ToString::to_string).collect(),
        destination,
    ))
}

/// Single-file transfer between two named locations.
#[must_use]
pub fn file_transfer(
    source_location: &str,
    source_path: &str,
    dest_location: &str,
    dest_path: &str,
) -> FileTransfer {
    FileTransfer {
        source_location: source_location.to_string(),
        source_path: source_path.to_string(),
        dest_location: dest_location.to_string(),
        dest_path: dest_path.to_string(),
        overwrite: false,
        verify_checksum: true,
        chunk_size: None,
    }
}
