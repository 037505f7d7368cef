//! File, batch, and directory transfers between named locations.
//!
//! # Design
//! - Bytes stream through a fixed-size buffer while a SHA-256 of the source is
//!   computed; verification re-reads the destination and compares digests.
//! - An existing destination without `overwrite` fails that file only.
//! - A destination written by a failed copy is removed again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use stratum_config::StorageConfig;
use stratum_core::{
    BatchFileTransfer, CancelSignal, DirectoryTransfer, FileTransfer, MAX_CHUNK_SIZE,
    OperationHandler, OperationOutcome, OperationPayload, StorageCapability, StorageSink,
};
use stratum_staging::StagingController;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::batch::{BatchReport, Limits, run_bounded};
use crate::error::{FsOpsError, FsOpsResult};
use crate::local::{LocalStorage, Locations};
use crate::rules::RuleSet;

/// Copy buffer used when a transfer does not set `chunk_size`.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// Files copied concurrently by a directory transfer.
pub const DIRECTORY_PARALLELISM: usize = 4;

/// Make `absolute` resident on disk before reading it.
pub(crate) async fn stage(
    staging: Option<&StagingController>,
    absolute: &Path,
    cancel: &CancelSignal,
) -> FsOpsResult<()> {
    let Some(staging) = staging else {
        return Ok(());
    };
    let path = absolute.to_string_lossy();
    let waited = staging.ensure_online(&path, None, cancel.clone()).await?;
    if !waited.is_zero() {
        info!(path = %path, waited_ms = waited.as_millis(), "file staged before read");
    }
    Ok(())
}

/// Streams files between locations; shared by every transfer task.
#[derive(Debug)]
pub struct TransferEngine {
    locations: Locations,
    staging: Option<Arc<StagingController>>,
}

impl TransferEngine {
    /// Engine over `locations` without staging.
    #[must_use]
    pub const fn new(locations: Locations) -> Self {
        Self {
            locations,
            staging: None,
        }
    }

    /// Ensure sources are online through `staging` before they are read.
    #[must_use]
    pub fn with_staging(mut self, staging: Arc<StagingController>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Registered locations.
    #[must_use]
    pub const fn locations(&self) -> &Locations {
        &self.locations
    }

    /// Copy one file and return the bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error when a location is unknown, the destination exists
    /// without `overwrite`, IO fails, the checksum differs, or `cancel` fires
    /// mid-copy.
    pub async fn transfer_file(
        &self,
        transfer: &FileTransfer,
        verify: bool,
        cancel: &CancelSignal,
    ) -> FsOpsResult<u64> {
        let source = self.locations.get(&transfer.source_location)?;
        let dest = self.locations.get(&transfer.dest_location)?;
        if !transfer.overwrite && dest.exists(&transfer.dest_path).await? {
            return Err(FsOpsError::DestinationExists {
                path: transfer.dest_path.clone(),
            });
        }
        stage(
            self.staging.as_deref(),
            &source.resolve(&transfer.source_path)?,
            cancel,
        )
        .await?;

        let chunk_size = transfer
            .chunk_size
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .clamp(1, MAX_CHUNK_SIZE);
        let dest_path = dest.resolve(&transfer.dest_path)?;
        let reader = source.open(&transfer.source_path).await?;
        let writer = dest.create(&transfer.dest_path, transfer.overwrite).await?;
        let (bytes, expected) = match pump(reader, writer, chunk_size, cancel, &dest_path).await {
            Ok(copied) => copied,
            Err(err) => {
                discard(dest, &transfer.dest_path).await;
                return Err(err);
            }
        };

        if verify {
            let reader = dest.open(&transfer.dest_path).await?;
            let (_, actual) = digest(reader, chunk_size, &dest_path).await?;
            if actual != expected {
                discard(dest, &transfer.dest_path).await;
                return Err(FsOpsError::ChecksumMismatch {
                    path: transfer.dest_path.clone(),
                    expected,
                    actual,
                });
            }
        }

        debug!(
            source = %transfer.source_path,
            dest = %transfer.dest_path,
            bytes,
            verified = verify,
            "file transferred"
        );
        Ok(bytes)
    }

    /// Run a batch, bounded by `parallel_transfers`.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::Cancelled`] when `cancel` fires; per-transfer
    /// failures are reported in the outcome.
    pub async fn transfer_batch(
        self: &Arc<Self>,
        batch: &BatchFileTransfer,
        cancel: &CancelSignal,
    ) -> FsOpsResult<OperationOutcome> {
        let items = batch
            .transfers
            .iter()
            .map(|transfer| {
                let verify = transfer.verify_checksum || batch.verify_all_checksums;
                (transfer.source_path.clone(), (transfer.clone(), verify))
            })
            .collect();
        let limits = Limits {
            parallel: batch.parallel_transfers,
            stop_on_error: batch.stop_on_error,
        };
        let mut report = BatchReport::default();
        self.run(items, limits, cancel, &mut report).await;
        report.into_outcome("batch_file_transfer")
    }

    /// Copy every admitted file under the source directory.
    ///
    /// # Errors
    ///
    /// Returns an error when a location is unknown, the patterns do not
    /// compile, or the source directory cannot be walked.
    pub async fn transfer_directory(
        self: &Arc<Self>,
        dir: &DirectoryTransfer,
        cancel: &CancelSignal,
    ) -> FsOpsResult<OperationOutcome> {
        let rules = RuleSet::new(&dir.include_patterns, &dir.exclude_patterns)?;
        let source = self.locations.get(&dir.source_location)?;
        let dest = self.locations.get(&dir.dest_location)?;
        let root = source.resolve(&dir.source_path)?;
        let recursive = dir.recursive;

        let files = tokio::task::spawn_blocking({
            let root = root.clone();
            move || walk_files(&root, recursive)
        })
        .await
        .map_err(|err| FsOpsError::io("directory.walk", &root, std::io::Error::other(err)))??;
        dest.create_dir_all(&dir.dest_path).await?;

        let items: Vec<(String, (FileTransfer, bool))> = files
            .into_iter()
            .filter(|relative| rules.admits(relative))
            .map(|relative| {
                let relative = relative.to_string_lossy().into_owned();
                let transfer = FileTransfer {
                    source_location: dir.source_location.clone(),
                    source_path: join(&dir.source_path, &relative),
                    dest_location: dir.dest_location.clone(),
                    dest_path: join(&dir.dest_path, &relative),
                    overwrite: dir.overwrite,
                    verify_checksum: dir.verify_checksums,
                    chunk_size: None,
                };
                (relative, (transfer, dir.verify_checksums))
            })
            .collect();
        info!(
            source = %dir.source_path,
            dest = %dir.dest_path,
            files = items.len(),
            "directory transfer planned"
        );

        let limits = Limits {
            parallel: DIRECTORY_PARALLELISM,
            stop_on_error: false,
        };
        let mut report = BatchReport::default();
        self.run(items, limits, cancel, &mut report).await;
        report.into_outcome("directory_transfer")
    }

    async fn run(
        self: &Arc<Self>,
        items: Vec<(String, (FileTransfer, bool))>,
        limits: Limits,
        cancel: &CancelSignal,
        report: &mut BatchReport,
    ) {
        run_bounded(items, limits, cancel, report, |(transfer, verify)| {
            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            async move { engine.transfer_file(&transfer, verify, &cancel).await }
        })
        .await;
    }
}

fn join(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        relative.to_string()
    } else {
        format!("{base}/{relative}")
    }
}

fn walk_files(root: &Path, recursive: bool) -> FsOpsResult<Vec<PathBuf>> {
    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source_err| FsOpsError::walkdir("directory.walk", root, source_err))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| FsOpsError::InvalidInput {
                field: "source_path",
                reason: "strip_prefix",
                value: Some(entry.path().to_string_lossy().into_owned()),
            })?;
        files.push(relative.to_path_buf());
    }
    Ok(files)
}

async fn pump(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    chunk_size: usize,
    cancel: &CancelSignal,
    dest_path: &Path,
) -> FsOpsResult<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; chunk_size];
    let mut bytes = 0_u64;
    loop {
        if cancel.is_cancelled() {
            return Err(FsOpsError::Cancelled {
                operation: "file_transfer",
            });
        }
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|err| FsOpsError::io("transfer.read", dest_path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|err| FsOpsError::io("transfer.write", dest_path, err))?;
        bytes += read as u64;
    }
    writer
        .shutdown()
        .await
        .map_err(|err| FsOpsError::io("transfer.flush", dest_path, err))?;
    Ok((bytes, format!("{:x}", hasher.finalize())))
}

async fn digest(
    mut reader: impl AsyncRead + Unpin,
    chunk_size: usize,
    path: &Path,
) -> FsOpsResult<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; chunk_size];
    let mut bytes = 0_u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|err| FsOpsError::io("transfer.verify", path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        bytes += read as u64;
    }
    Ok((bytes, format!("{:x}", hasher.finalize())))
}

async fn discard(dest: &LocalStorage, path: &str) {
    if let Err(err) = dest.remove(path).await {
        debug!(path, error = %err, "partial destination not removed");
    }
}

/// Handles single, batch, and directory transfers.
#[derive(Debug)]
pub struct TransferHandler {
    engine: Arc<TransferEngine>,
}

impl TransferHandler {
    /// Handler over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<TransferEngine>) -> Self {
        Self { engine }
    }

    /// Handler over the configured locations, staging sources when `staging`
    /// is set and the config asks for it.
    #[must_use]
    pub fn from_config(config: &StorageConfig, staging: Option<Arc<StagingController>>) -> Self {
        let mut engine = TransferEngine::new(Locations::from_roots(&config.locations));
        if config.stage_before_read
            && let Some(staging) = staging
        {
            engine = engine.with_staging(staging);
        }
        Self::new(Arc::new(engine))
    }

    /// Shared engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }
}

#[async_trait]
impl OperationHandler for TransferHandler {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn can_handle(&self, payload: &OperationPayload) -> bool {
        matches!(
            payload,
            OperationPayload::FileTransfer(_)
                | OperationPayload::BatchFileTransfer(_)
                | OperationPayload::DirectoryTransfer(_)
        )
    }

    async fn execute(
        &self,
        payload: &OperationPayload,
        cancel: CancelSignal,
    ) -> anyhow::Result<OperationOutcome> {
        let outcome = match payload {
            OperationPayload::FileTransfer(transfer) => {
                match self
                    .engine
                    .transfer_file(transfer, transfer.verify_checksum, &cancel)
                    .await
                {
                    Ok(bytes) => Ok(OperationOutcome::from_items(
                        vec![transfer.source_path.clone()],
                        Vec::new(),
                        bytes,
                    )
                    .with_message(format!("file_transfer: 1 item(s), {bytes} bytes"))),
                    Err(err @ FsOpsError::Cancelled { .. }) => Err(err),
                    Err(err) => {
                        warn!(source = %transfer.source_path, error = %err.reason(), "file transfer failed");
                        Ok(OperationOutcome::from_items(
                            Vec::new(),
                            vec![format!("{}: {}", transfer.source_path, err.reason())],
                            0,
                        ))
                    }
                }
            }
            OperationPayload::BatchFileTransfer(batch) => {
                self.engine.transfer_batch(batch, &cancel).await
            }
            OperationPayload::DirectoryTransfer(dir) => {
                self.engine.transfer_directory(dir, &cancel).await
            }
            OperationPayload::BulkArchive(_) => {
                return Err(anyhow!("transfer handler does not accept {}", payload.kind()));
            }
        };
        Ok(outcome?)
    }
}
