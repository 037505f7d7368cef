//! Archive member extraction.
//!
//! # Design
//! - Synchronous; callers run it on the blocking pool.
//! - Entry paths are sanitised before joining onto the target; absolute paths
//!   and `..` segments fail the whole archive.
//! - Only regular files are written. Links and special files are skipped.

use std::fs::{self, File};
use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;
use zip::ZipArchive;

use crate::error::{FsOpsError, FsOpsResult};
use crate::rules::RuleSet;

/// Container formats the archive engine can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Plain tar.
    Tar,
    /// Gzip-compressed tar (`.tar.gz`, `.tgz`).
    TarGz,
    /// Zip with stored or deflated members.
    Zip,
}

impl ArchiveFormat {
    /// Infer the format from a file name.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::Unsupported`] for unknown extensions and
    /// [`FsOpsError::InvalidInput`] when there is no extension.
    pub fn detect(name: &str) -> FsOpsResult<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Ok(Self::TarGz);
        }
        match Path::new(&lower).extension().and_then(|ext| ext.to_str()) {
            Some("tar") => Ok(Self::Tar),
            Some("zip") => Ok(Self::Zip),
            Some(other) => Err(FsOpsError::Unsupported {
                operation: "extract_archive",
                value: Some(other.to_string()),
            }),
            None => Err(FsOpsError::InvalidInput {
                field: "archive_extension",
                reason: "missing",
                value: Some(name.to_string()),
            }),
        }
    }
}

/// What an extraction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// Files written.
    pub files: usize,
    /// Bytes written.
    pub bytes: u64,
    /// Members filtered out or not regular files.
    pub skipped: usize,
}

/// Unpack `source` into `target`, writing only members `rules` admits.
///
/// # Errors
///
/// Returns an error when the archive cannot be read, a member path is unsafe,
/// or a member cannot be written.
pub fn extract_archive(
    source: &Path,
    format: ArchiveFormat,
    target: &Path,
    rules: &RuleSet,
) -> FsOpsResult<ExtractReport> {
    fs::create_dir_all(target)
        .map_err(|source_err| FsOpsError::io("extract.create_target", target, source_err))?;
    let file = File::open(source)
        .map_err(|source_err| FsOpsError::io("extract.open", source, source_err))?;
    match format {
        ArchiveFormat::Tar => extract_tar(tar::Archive::new(file), source, target, rules),
        ArchiveFormat::TarGz => {
            extract_tar(tar::Archive::new(GzDecoder::new(file)), source, target, rules)
        }
        ArchiveFormat::Zip => extract_zip(file, source, target, rules),
    }
}

fn extract_tar<R: Read>(
    mut archive: tar::Archive<R>,
    source: &Path,
    target: &Path,
    rules: &RuleSet,
) -> FsOpsResult<ExtractReport> {
    let mut report = ExtractReport::default();
    let entries = archive
        .entries()
        .map_err(|source_err| FsOpsError::io("extract_tar.entries", source, source_err))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|source_err| FsOpsError::io("extract_tar.read_entry", source, source_err))?;
        let raw = entry
            .path()
            .map_err(|source_err| FsOpsError::io("extract_tar.entry_path", source, source_err))?
            .to_string_lossy()
            .into_owned();
        let relative = sanitize_archive_path(&raw)?;
        let entry_type = entry.header().entry_type();
        if relative.as_os_str().is_empty() || entry_type.is_dir() {
            continue;
        }
        if !entry_type.is_file() {
            debug!(entry = %raw, "skipping non-regular archive member");
            report.skipped += 1;
            continue;
        }
        if !rules.admits(&relative) {
            report.skipped += 1;
            continue;
        }
        let destination = target.join(&relative);
        report.bytes += write_member(&mut entry, &destination)?;
        report.files += 1;
    }
    Ok(report)
}

fn extract_zip(
    file: File,
    source: &Path,
    target: &Path,
    rules: &RuleSet,
) -> FsOpsResult<ExtractReport> {
    let mut archive = ZipArchive::new(file)
        .map_err(|source_err| FsOpsError::zip("extract_zip.decode", source, source_err))?;
    let mut report = ExtractReport::default();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|source_err| FsOpsError::zip("extract_zip.read_entry", source, source_err))?;
        let relative = sanitize_archive_path(entry.name())?;
        if relative.as_os_str().is_empty() || entry.is_dir() {
            continue;
        }
        if !rules.admits(&relative) {
            report.skipped += 1;
            continue;
        }

        let destination = target.join(&relative);
        report.bytes += write_member(&mut entry, &destination)?;
        report.files += 1;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            let perms = fs::Permissions::from_mode(mode);
            fs::set_permissions(&destination, perms).map_err(|source_err| {
                FsOpsError::io("extract_zip.set_permissions", &destination, source_err)
            })?;
        }
    }

    Ok(report)
}

fn write_member(reader: &mut impl Read, destination: &Path) -> FsOpsResult<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|source_err| FsOpsError::io("extract.create_parent", parent, source_err))?;
    }
    let mut output = File::create(destination)
        .map_err(|source_err| FsOpsError::io("extract.create_file", destination, source_err))?;
    io::copy(reader, &mut output)
        .map_err(|source_err| FsOpsError::io("extract.copy", destination, source_err))
}

/// Relative path for an archive member, rejecting absolute paths and `..`.
///
/// # Errors
///
/// Returns [`FsOpsError::InvalidInput`] for unsafe entry names.
pub fn sanitize_archive_path(entry: &str) -> FsOpsResult<PathBuf> {
    let path = Path::new(entry);
    if path.is_absolute() {
        return Err(FsOpsError::InvalidInput {
            field: "archive_entry",
            reason: "absolute_path",
            value: Some(entry.to_string()),
        });
    }

    let mut sanitized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => sanitized.push(segment),
            Component::CurDir => {}
            _ => {
                return Err(FsOpsError::InvalidInput {
                    field: "archive_entry",
                    reason: "invalid_segment",
                    value: Some(entry.to_string()),
                });
            }
        }
    }

    Ok(sanitized)
}
