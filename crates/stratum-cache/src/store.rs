//! The cache store: budgets, eviction, materialisation, and persistence.
//!
//! # Design
//! - One mutex serialises every mutation and consistent `status` read.
//! - Pools are per entry kind unless the configuration unifies them.
//! - The index is rewritten after each mutation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use stratum_config::CacheConfiguration;
use stratum_core::CacheEntryKind;
use stratum_events::{Event, EventBus};
use stratum_telemetry::Metrics;
use tracing::{debug, error, info, warn};

use crate::entry::{CacheEntry, CacheStatus, CleanupReport};
use crate::error::{CacheError, CacheResult};
use crate::eviction;
use crate::index;

const ALL_KINDS: [CacheEntryKind; 2] = [CacheEntryKind::Archive, CacheEntryKind::File];

/// Byte-budgeted cache shared by every worker.
pub struct CacheStore {
    root: PathBuf,
    config: CacheConfiguration,
    state: Mutex<CacheState>,
    events: Option<EventBus>,
    metrics: Option<Metrics>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

impl CacheState {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl CacheStore {
    /// Open (or create) the cache rooted at `config.directory`.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache directories cannot be created.
    pub fn open(config: CacheConfiguration) -> CacheResult<Self> {
        let root = config.directory.clone();
        for kind in ALL_KINDS {
            let dir = root.join(kind.directory());
            fs::create_dir_all(&dir).map_err(|err| CacheError::io("cache.mkdir", &dir, err))?;
        }
        let entries = index::load(&root);
        let next_seq = entries.values().map(|entry| entry.access_seq).max().unwrap_or(0);
        info!(
            root = %root.display(),
            entries = entries.len(),
            policy = %config.cleanup_policy,
            unified = config.unified_cache,
            "cache opened"
        );
        Ok(Self {
            root,
            config,
            state: Mutex::new(CacheState { entries, next_seq }),
            events: None,
            metrics: None,
        })
    }

    /// Publish eviction events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Record occupancy and evictions on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self.publish_usage(&self.lock_state());
        self
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfiguration {
        &self.config
    }

    /// Register an entry of `size_bytes` without materialising bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ResourceLimitExceeded`] when the entry does not
    /// fit after cleanup; an entry previously stored under `key` is kept.
    pub fn put(
        &self,
        key: &str,
        size_bytes: u64,
        kind: CacheEntryKind,
        tags: impl IntoIterator<Item = String>,
    ) -> CacheResult<()> {
        index::validate_key(key)?;
        let mut state = self.lock_state();
        let replaced = self.admit(&mut state, key, size_bytes, kind)?;
        let entry = self.new_entry(&mut state, key, size_bytes, kind, tags, None, None);
        self.commit(&mut state, entry, None, replaced)
    }

    /// Store `bytes` under `key` and return the materialised path.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry does not fit or the bytes cannot be
    /// written; an entry previously stored under `key` is kept.
    pub fn put_bytes(
        &self,
        key: &str,
        kind: CacheEntryKind,
        bytes: &[u8],
        tags: impl IntoIterator<Item = String>,
    ) -> CacheResult<PathBuf> {
        index::validate_key(key)?;
        let size = bytes.len() as u64;
        let relative = index::relative_path(kind, key);
        let absolute = self.root.join(&relative);
        let staging = staging_path(&absolute);
        let mut state = self.lock_state();
        if let Err(err) = index::write_atomic(&staging, bytes) {
            discard_staged(&staging);
            return Err(err);
        }
        let replaced = match self.admit(&mut state, key, size, kind) {
            Ok(replaced) => replaced,
            Err(err) => {
                discard_staged(&staging);
                return Err(err);
            }
        };
        let checksum = index::hex_digest(bytes);
        let entry = self.new_entry(
            &mut state,
            key,
            size,
            kind,
            tags,
            Some(checksum),
            Some(relative),
        );
        self.commit(&mut state, entry, Some(staging.as_path()), replaced)?;
        Ok(absolute)
    }

    /// Copy the file at `source` into the cache under `key` and return the cached path.
    ///
    /// # Errors
    ///
    /// Returns an error when the source cannot be read, the entry does not
    /// fit, or the copy fails; an entry previously stored under `key` is kept.
    pub fn put_file(
        &self,
        key: &str,
        kind: CacheEntryKind,
        source: &Path,
        tags: impl IntoIterator<Item = String>,
    ) -> CacheResult<PathBuf> {
        index::validate_key(key)?;
        let relative = index::relative_path(kind, key);
        let absolute = self.root.join(&relative);
        let staging = staging_path(&absolute);
        let mut state = self.lock_state();
        let size = match fs::copy(source, &staging) {
            Ok(size) => size,
            Err(err) => {
                discard_staged(&staging);
                return Err(CacheError::io("cache.copy", source, err));
            }
        };
        let replaced = match self.admit(&mut state, key, size, kind) {
            Ok(replaced) => replaced,
            Err(err) => {
                discard_staged(&staging);
                return Err(err);
            }
        };
        let entry = self.new_entry(&mut state, key, size, kind, tags, None, Some(relative));
        self.commit(&mut state, entry, Some(staging.as_path()), replaced)?;
        Ok(absolute)
    }

    /// Snapshot of an entry without counting an access.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock_state().entries.get(key).cloned()
    }

    /// Whether `key` is tracked.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock_state().entries.contains_key(key)
    }

    /// Record a read-hit. Returns `false` for unknown keys.
    pub fn touch(&self, key: &str) -> bool {
        let mut state = self.lock_state();
        let seq = state.bump_seq();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        entry.last_accessed_at = Utc::now();
        entry.access_count += 1;
        entry.access_seq = seq;
        self.persist(&state);
        true
    }

    /// Materialised path for `key`, counting the lookup as a read-hit.
    #[must_use]
    pub fn path_of(&self, key: &str) -> Option<PathBuf> {
        let mut state = self.lock_state();
        let seq = state.bump_seq();
        let entry = state.entries.get_mut(key)?;
        let location = entry.location.clone()?;
        entry.last_accessed_at = Utc::now();
        entry.access_count += 1;
        entry.access_seq = seq;
        self.persist(&state);
        Some(self.root.join(location))
    }

    /// All tracked entries, most recently accessed first.
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.lock_state().entries.values().cloned().collect();
        entries.sort_by(|a, b| b.access_seq.cmp(&a.access_seq));
        entries
    }

    /// Remove an entry and its bytes. Returns `false` for unknown keys.
    ///
    /// # Errors
    ///
    /// Returns an error when materialised bytes cannot be deleted.
    pub fn remove(&self, key: &str) -> CacheResult<bool> {
        let mut state = self.lock_state();
        let Some(entry) = state.entries.remove(key) else {
            return Ok(false);
        };
        self.delete_bytes(&entry)?;
        debug!(key, bytes = entry.size_bytes, "cache entry removed");
        self.persist(&state);
        self.publish_usage(&state);
        Ok(true)
    }

    /// Occupancy across every pool.
    #[must_use]
    pub fn status(&self) -> CacheStatus {
        let state = self.lock_state();
        let limit = self.config.archive_size_limit + self.config.file_size_limit;
        summarize(state.entries.values(), limit)
    }

    /// Occupancy of the pool that holds `kind` entries.
    #[must_use]
    pub fn status_for(&self, kind: CacheEntryKind) -> CacheStatus {
        let state = self.lock_state();
        summarize(
            state
                .entries
                .values()
                .filter(|entry| self.same_pool(entry.kind, kind)),
            self.pool_limit(kind),
        )
    }

    /// Reclaim space according to the configured policy.
    ///
    /// Without `force`, a pool is only cleaned when above 80% of its budget
    /// and cleaning stops at 70%. With `force`, every entry in scope is
    /// removed. `Manual` never removes anything.
    ///
    /// # Errors
    ///
    /// Returns an error when materialised bytes cannot be deleted.
    pub fn cleanup(&self, force: bool) -> CacheResult<CleanupReport> {
        let started = Instant::now();
        let mut state = self.lock_state();
        let mut report = CleanupReport::default();
        for kind in self.pool_representatives() {
            report.absorb(self.evict(&mut state, kind, 0, force)?);
        }
        report.duration = started.elapsed();
        if report.entries_removed > 0 {
            self.persist(&state);
            self.publish_usage(&state);
        }
        Ok(report)
    }

    /// Remove every entry, or every entry of one kind, regardless of policy.
    ///
    /// # Errors
    ///
    /// Returns an error when materialised bytes cannot be deleted.
    pub fn clear(&self, kind: Option<CacheEntryKind>) -> CacheResult<CleanupReport> {
        let started = Instant::now();
        let mut state = self.lock_state();
        let keys: Vec<String> = state
            .entries
            .values()
            .filter(|entry| kind.is_none_or(|wanted| entry.kind == wanted))
            .map(|entry| entry.key.clone())
            .collect();
        let mut report = CleanupReport::default();
        for key in keys {
            if let Some(entry) = state.entries.remove(&key) {
                self.delete_bytes(&entry)?;
                report.entries_removed += 1;
                report.bytes_removed += entry.size_bytes;
            }
        }
        report.duration = started.elapsed();
        info!(
            kind = kind.map_or("all", CacheEntryKind::as_str),
            entries = report.entries_removed,
            bytes = report.bytes_removed,
            "cache cleared"
        );
        self.persist(&state);
        self.publish_usage(&state);
        Ok(report)
    }

    /// Make room for `size` bytes under `key`, returning the entry it replaces.
    ///
    /// The replaced entry is detached from the index but its bytes stay on
    /// disk until [`Self::commit`] succeeds.
    fn admit(
        &self,
        state: &mut CacheState,
        key: &str,
        size: u64,
        kind: CacheEntryKind,
    ) -> CacheResult<Option<CacheEntry>> {
        let limit = self.pool_limit(kind);
        if size > limit {
            return Err(CacheError::ResourceLimitExceeded {
                kind,
                limit,
                attempted: size,
            });
        }
        let replaced = state.entries.remove(key);
        if self.pool_used(state, kind) + size > limit {
            match self.evict(state, kind, size, false) {
                Ok(report) if report.entries_removed > 0 => {
                    debug!(key, removed = report.entries_removed, "made room for insert");
                }
                Ok(_) => {}
                Err(err) => {
                    restore(state, replaced);
                    return Err(err);
                }
            }
        }
        let used = self.pool_used(state, kind);
        if used + size > limit {
            restore(state, replaced);
            warn!(key, size, limit, used, "cache insert rejected");
            return Err(CacheError::ResourceLimitExceeded {
                kind,
                limit,
                attempted: size,
            });
        }
        Ok(replaced)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_entry(
        &self,
        state: &mut CacheState,
        key: &str,
        size_bytes: u64,
        kind: CacheEntryKind,
        tags: impl IntoIterator<Item = String>,
        checksum: Option<String>,
        location: Option<PathBuf>,
    ) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            size_bytes,
            kind,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            checksum,
            tags: tags.into_iter().collect(),
            location,
            access_seq: state.bump_seq(),
        }
    }

    /// Publish `entry`: save the index, then move staged bytes into place.
    ///
    /// On failure the store is returned to its state before the insert.
    fn commit(
        &self,
        state: &mut CacheState,
        entry: CacheEntry,
        staged: Option<&Path>,
        replaced: Option<CacheEntry>,
    ) -> CacheResult<()> {
        let key = entry.key.clone();
        let location = entry.location.clone();
        let size = entry.size_bytes;
        let kind = entry.kind;
        state.entries.insert(key.clone(), entry);
        let published = index::save(&self.root, &state.entries).and_then(|()| {
            match (staged, &location) {
                (Some(staging), Some(relative)) => {
                    let absolute = self.root.join(relative);
                    fs::rename(staging, &absolute)
                        .map_err(|err| CacheError::io("cache.commit.rename", absolute, err))
                }
                _ => Ok(()),
            }
        });
        if let Err(err) = published {
            state.entries.remove(&key);
            restore(state, replaced);
            if let Some(staging) = staged {
                discard_staged(staging);
            }
            self.persist(state);
            warn!(key = %key, error = %err, "cache insert rolled back");
            return Err(err);
        }
        if let Some(previous) = replaced
            && previous.location != location
            && let Err(err) = self.delete_bytes(&previous)
        {
            warn!(key = %key, error = %err, "stale cached bytes left behind");
        }
        debug!(key = %key, bytes = size, kind = kind.as_str(), "cache entry stored");
        self.publish_usage(state);
        Ok(())
    }

    fn evict(
        &self,
        state: &mut CacheState,
        kind: CacheEntryKind,
        incoming: u64,
        force: bool,
    ) -> CacheResult<CleanupReport> {
        let policy = self.config.cleanup_policy;
        let victims = eviction::plan(
            policy,
            state
                .entries
                .values()
                .filter(|entry| self.same_pool(entry.kind, kind)),
            self.pool_limit(kind),
            incoming,
            force,
        );
        let mut report = CleanupReport::default();
        for key in victims {
            if let Some(entry) = state.entries.remove(&key) {
                self.delete_bytes(&entry)?;
                report.entries_removed += 1;
                report.bytes_removed += entry.size_bytes;
            }
        }
        if report.entries_removed > 0 {
            info!(
                policy = %policy,
                pool = self.pool_label(kind),
                entries = report.entries_removed,
                bytes = report.bytes_removed,
                "cache entries evicted"
            );
            if let Some(metrics) = &self.metrics {
                metrics.add_cache_evictions(policy.as_str(), report.entries_removed);
            }
            if let Some(events) = &self.events {
                events.publish(Event::CacheEvicted {
                    policy: policy.as_str().to_string(),
                    entries_removed: report.entries_removed,
                    bytes_removed: report.bytes_removed,
                });
            }
        }
        Ok(report)
    }

    fn delete_bytes(&self, entry: &CacheEntry) -> CacheResult<()> {
        let Some(relative) = &entry.location else {
            return Ok(());
        };
        let path = self.root.join(relative);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::io("cache.evict", path, err)),
        }
    }

    const fn same_pool(&self, a: CacheEntryKind, b: CacheEntryKind) -> bool {
        self.config.unified_cache
            || matches!(
                (a, b),
                (CacheEntryKind::Archive, CacheEntryKind::Archive)
                    | (CacheEntryKind::File, CacheEntryKind::File)
            )
    }

    const fn pool_limit(&self, kind: CacheEntryKind) -> u64 {
        if self.config.unified_cache {
            self.config.archive_size_limit + self.config.file_size_limit
        } else {
            match kind {
                CacheEntryKind::Archive => self.config.archive_size_limit,
                CacheEntryKind::File => self.config.file_size_limit,
            }
        }
    }

    const fn pool_label(&self, kind: CacheEntryKind) -> &'static str {
        if self.config.unified_cache {
            "unified"
        } else {
            kind.as_str()
        }
    }

    fn pool_representatives(&self) -> Vec<CacheEntryKind> {
        if self.config.unified_cache {
            vec![CacheEntryKind::Archive]
        } else {
            ALL_KINDS.to_vec()
        }
    }

    fn pool_used(&self, state: &CacheState, kind: CacheEntryKind) -> u64 {
        state
            .entries
            .values()
            .filter(|entry| self.same_pool(entry.kind, kind))
            .map(|entry| entry.size_bytes)
            .sum()
    }

    fn persist(&self, state: &CacheState) {
        if let Err(err) = index::save(&self.root, &state.entries) {
            error!(error = %err, root = %self.root.display(), "failed to persist cache index");
        }
    }

    fn publish_usage(&self, state: &CacheState) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let mut seen = HashSet::new();
        for kind in self.pool_representatives() {
            let label = self.pool_label(kind);
            if seen.insert(label) {
                metrics.set_cache_used_bytes(label, self.pool_used(state, kind));
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("cache state lock poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }
}

fn restore(state: &mut CacheState, replaced: Option<CacheEntry>) {
    if let Some(previous) = replaced {
        state.entries.insert(previous.key.clone(), previous);
    }
}

fn staging_path(absolute: &Path) -> PathBuf {
    let mut name = absolute.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    absolute.with_file_name(name)
}

fn discard_staged(staging: &Path) {
    match fs::remove_file(staging) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %staging.display(), error = %err, "staged cache bytes left behind"),
    }
}

fn summarize<'a>(entries: impl Iterator<Item = &'a CacheEntry>, limit: u64) -> CacheStatus {
    let mut status = CacheStatus {
        total_limit: limit,
        used: 0,
        available: limit,
        entry_count: 0,
        archive_count: 0,
        file_count: 0,
        oldest_entry_time: None,
        newest_entry_time: None,
    };
    for entry in entries {
        status.used += entry.size_bytes;
        status.entry_count += 1;
        match entry.kind {
            CacheEntryKind::Archive => status.archive_count += 1,
            CacheEntryKind::File => status.file_count += 1,
        }
        status.oldest_entry_time = Some(
            status
                .oldest_entry_time
                .map_or(entry.created_at, |t| t.min(entry.created_at)),
        );
        status.newest_entry_time = Some(
            status
                .newest_entry_time
                .map_or(entry.created_at, |t| t.max(entry.created_at)),
        );
    }
    status.available = limit.saturating_sub(status.used);
    status
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("root", &self.root)
            .field("policy", &self.config.cleanup_policy)
            .field("unified", &self.config.unified_cache)
            .finish_non_exhaustive()
    }
}
