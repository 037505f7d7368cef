//! Bulk copy, move, and extraction of catalogued archives through the cache.
//!
//! # Design
//! - Every archive is read through the cache under `archive:<id>`; a hit only
//!   refreshes the entry's recency, a miss stages the source and admits a copy.
//! - Unknown or missing archives are recorded as failures before any work starts.
//! - Archives run concurrently, bounded by `parallel_operations`.
//! - A cached copy evicted by a concurrent admission before it is opened is
//!   read from its source instead.
//! - Copies land at `<destination>/<file name>`; extractions under `<destination>/<id>/`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use stratum_cache::{CacheError, CacheStore};
use stratum_config::{ArchiveSource, StorageConfig};
use stratum_core::{
    BulkArchiveKind, BulkArchiveOperation, CacheEntryKind, CancelSignal, OperationHandler,
    OperationOutcome, OperationPayload, StorageCapability, StorageSink,
};
use stratum_staging::StagingController;
use tracing::{debug, info, warn};

use crate::batch::{BatchReport, Limits, run_bounded};
use crate::error::{FsOpsError, FsOpsResult};
use crate::extract::{ArchiveFormat, extract_archive};
use crate::local::Locations;
use crate::rules::RuleSet;
use crate::transfer::stage;

/// Cache key for an archive identifier.
#[must_use]
pub fn archive_cache_key(archive_id: &str) -> String {
    format!("archive:{archive_id}")
}

/// Archive identifiers and where each one lives.
#[derive(Debug, Clone, Default)]
pub struct ArchiveCatalog {
    archives: BTreeMap<String, ArchiveSource>,
}

impl ArchiveCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the configured archives.
    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            archives: config.archives.clone(),
        }
    }

    /// Register or replace an archive.
    #[must_use]
    pub fn with_archive(mut self, archive_id: &str, location: &str, path: &str) -> Self {
        self.archives.insert(
            archive_id.to_string(),
            ArchiveSource {
                location: location.to_string(),
                path: path.to_string(),
            },
        );
        self
    }

    /// Source of `archive_id`.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::UnknownArchive`] for identifiers not in the catalog.
    pub fn get(&self, archive_id: &str) -> FsOpsResult<&ArchiveSource> {
        self.archives
            .get(archive_id)
            .ok_or_else(|| FsOpsError::UnknownArchive {
                archive_id: archive_id.to_string(),
            })
    }

    /// Number of catalogued archives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.archives.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

/// One archive ready for processing.
#[derive(Debug, Clone)]
struct Planned {
    archive_id: String,
    source: ArchiveSource,
    absolute: PathBuf,
}

/// Performs archive-level work against the cache and named locations.
#[derive(Debug)]
pub struct ArchiveEngine {
    locations: Locations,
    catalog: ArchiveCatalog,
    cache: Arc<CacheStore>,
    staging: Option<Arc<StagingController>>,
}

impl ArchiveEngine {
    /// Engine without staging.
    #[must_use]
    pub const fn new(locations: Locations, catalog: ArchiveCatalog, cache: Arc<CacheStore>) -> Self {
        Self {
            locations,
            catalog,
            cache,
            staging: None,
        }
    }

    /// Stage archives through `staging` before they are cached.
    #[must_use]
    pub fn with_staging(mut self, staging: Arc<StagingController>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Cache the engine reads through.
    #[must_use]
    pub const fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Run a bulk operation.
    ///
    /// # Errors
    ///
    /// Returns an error when the destination location is unknown, the
    /// extraction filter does not compile, or `cancel` fires. Per-archive
    /// failures are reported in the outcome.
    pub async fn run(
        self: &Arc<Self>,
        op: &BulkArchiveOperation,
        cancel: &CancelSignal,
    ) -> FsOpsResult<OperationOutcome> {
        self.locations.get(&op.destination_location)?;
        let rules = Arc::new(RuleSet::new(
            &op.extract_filter.include_patterns,
            &op.extract_filter.exclude_patterns,
        )?);

        let mut report = BatchReport::default();
        let mut planned = Vec::new();
        for archive_id in &op.archive_ids {
            match self.plan(archive_id).await {
                Ok(item) => planned.push((archive_id.clone(), item)),
                Err(err) => {
                    warn!(archive_id = %archive_id, error = %err.reason(), "archive unavailable");
                    report.fail(archive_id, &err);
                }
            }
        }
        if op.stop_on_error && !report.failed.is_empty() {
            report.not_started = planned.len();
            return report.into_outcome(op_label(op.kind));
        }
        info!(
            kind = op_label(op.kind),
            archives = planned.len(),
            missing = report.failed.len(),
            destination = %op.destination_location,
            "bulk archive operation planned"
        );

        let limits = Limits {
            parallel: op.parallel_operations,
            stop_on_error: op.stop_on_error,
        };
        run_bounded(planned, limits, cancel, &mut report, |item| {
            let engine = Arc::clone(self);
            let rules = Arc::clone(&rules);
            let cancel = cancel.clone();
            let kind = op.kind;
            let destination = op.destination_location.clone();
            let simulation = op.simulation_id.clone();
            async move {
                engine
                    .process(item, kind, &destination, simulation, &rules, &cancel)
                    .await
            }
        })
        .await;
        report.into_outcome(op_label(op.kind))
    }

    async fn plan(&self, archive_id: &str) -> FsOpsResult<Planned> {
        let source = self.catalog.get(archive_id)?.clone();
        let storage = self.locations.get(&source.location)?;
        let absolute = storage.resolve(&source.path)?;
        if !self.cache.contains(&archive_cache_key(archive_id)) && !storage.exists(&source.path).await? {
            return Err(FsOpsError::UnknownArchive {
                archive_id: archive_id.to_string(),
            });
        }
        Ok(Planned {
            archive_id: archive_id.to_string(),
            source,
            absolute,
        })
    }

    async fn process(
        &self,
        item: Planned,
        kind: BulkArchiveKind,
        destination: &str,
        simulation: Option<String>,
        rules: &RuleSet,
        cancel: &CancelSignal,
    ) -> FsOpsResult<u64> {
        let cached = self.fetch(&item, simulation, cancel).await?;
        if cancel.is_cancelled() {
            return Err(FsOpsError::Cancelled {
                operation: op_label(kind),
            });
        }
        let dest = self.locations.get(destination)?;
        let bytes = match kind {
            BulkArchiveKind::Copy | BulkArchiveKind::Move => {
                let file_name = Path::new(&item.source.path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| item.archive_id.clone());
                let target = dest.resolve(&file_name)?;
                let bytes = read_with_fallback(&item, cached, |path| {
                    let target = target.clone();
                    async move { copy_file(&path, &target).await }
                })
                .await?;
                if kind == BulkArchiveKind::Move {
                    let source = self.locations.get(&item.source.location)?;
                    source.remove(&item.source.path).await?;
                    debug!(archive_id = %item.archive_id, "source archive removed after move");
                }
                bytes
            }
            BulkArchiveKind::Extract => {
                let format = ArchiveFormat::detect(&item.source.path)?;
                let target = dest.resolve(&item.archive_id)?;
                let report = read_with_fallback(&item, cached, |path| {
                    let target = target.clone();
                    let rules = rules.clone();
                    async move {
                        tokio::task::spawn_blocking({
                            let target = target.clone();
                            move || extract_archive(&path, format, &target, &rules)
                        })
                        .await
                        .map_err(|err| {
                            FsOpsError::io("extract.join", &target, std::io::Error::other(err))
                        })?
                    }
                })
                .await?;
                debug!(
                    archive_id = %item.archive_id,
                    files = report.files,
                    skipped = report.skipped,
                    "archive extracted"
                );
                report.bytes
            }
        };
        info!(archive_id = %item.archive_id, kind = op_label(kind), bytes, "archive processed");
        Ok(bytes)
    }

    /// Path of a cached copy of the archive, admitting it on a miss.
    async fn fetch(
        &self,
        item: &Planned,
        simulation: Option<String>,
        cancel: &CancelSignal,
    ) -> FsOpsResult<PathBuf> {
        let key = archive_cache_key(&item.archive_id);
        if let Some(path) = self.cache.path_of(&key)
            && tokio::fs::try_exists(&path).await.unwrap_or(false)
        {
            debug!(archive_id = %item.archive_id, "archive cache hit");
            return Ok(path);
        }

        stage(self.staging.as_deref(), &item.absolute, cancel).await?;
        let cache = Arc::clone(&self.cache);
        let source = item.absolute.clone();
        let tags: Vec<String> = std::iter::once("archive".to_string())
            .chain(simulation.map(|id| format!("simulation:{id}")))
            .collect();
        let admitted = tokio::task::spawn_blocking({
            let key = key.clone();
            move || cache.put_file(&key, CacheEntryKind::Archive, &source, tags)
        })
        .await
        .map_err(|err| FsOpsError::io("cache.join", &item.absolute, std::io::Error::other(err)))?;
        match admitted {
            Ok(path) => Ok(path),
            Err(CacheError::ResourceLimitExceeded { limit, attempted, .. }) => {
                warn!(
                    archive_id = %item.archive_id,
                    limit,
                    attempted,
                    "archive does not fit in cache; reading from source"
                );
                Ok(item.absolute.clone())
            }
            Err(err) => Err(err.into()),
        }
    }
}

const fn op_label(kind: BulkArchiveKind) -> &'static str {
    match kind {
        BulkArchiveKind::Copy => "bulk_copy",
        BulkArchiveKind::Move => "bulk_move",
        BulkArchiveKind::Extract => "bulk_extract",
    }
}

/// Run `read` on the cached copy, retrying on the source when the copy is gone.
async fn read_with_fallback<T, F, Fut>(item: &Planned, cached: PathBuf, read: F) -> FsOpsResult<T>
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = FsOpsResult<T>>,
{
    let from_cache = cached != item.absolute;
    match read(cached).await {
        Err(err) if from_cache && err.is_not_found() => {
            warn!(
                archive_id = %item.archive_id,
                "cached archive evicted before it was read; reading from source"
            );
            read(item.absolute.clone()).await
        }
        result => result,
    }
}

async fn copy_file(source: &Path, target: &Path) -> FsOpsResult<u64> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| FsOpsError::io("archive.create_parent", parent, err))?;
    }
    tokio::fs::copy(source, target)
        .await
        .map_err(|err| FsOpsError::io("archive.copy", target, err))
}

/// Handles bulk archive copy, move, and extract payloads.
#[derive(Debug)]
pub struct ArchiveHandler {
    engine: Arc<ArchiveEngine>,
}

impl ArchiveHandler {
    /// Handler over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<ArchiveEngine>) -> Self {
        Self { engine }
    }

    /// Handler over the configured locations and catalog.
    #[must_use]
    pub fn from_config(
        config: &StorageConfig,
        cache: Arc<CacheStore>,
        staging: Option<Arc<StagingController>>,
    ) -> Self {
        let mut engine = ArchiveEngine::new(
            Locations::from_roots(&config.locations),
            ArchiveCatalog::from_config(config),
            cache,
        );
        if config.stage_before_read
            && let Some(staging) = staging
        {
            engine = engine.with_staging(staging);
        }
        Self::new(Arc::new(engine))
    }
}

#[async_trait]
impl OperationHandler for ArchiveHandler {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn can_handle(&self, payload: &OperationPayload) -> bool {
        matches!(payload, OperationPayload::BulkArchive(_))
    }

    async fn execute(
        &self,
        payload: &OperationPayload,
        cancel: CancelSignal,
    ) -> anyhow::Result<OperationOutcome> {
        let OperationPayload::BulkArchive(op) = payload else {
            return Err(anyhow!("archive handler does not accept {}", payload.kind()));
        };
        Ok(self.engine.run(op, &cancel).await?)
    }
}
