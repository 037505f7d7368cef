//! Cache entry records and reporting types.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::CacheEntryKind;

/// One tracked cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Lookup key (e.g. `archive:<id>`).
    pub key: String,
    /// Bytes charged against the pool budget.
    pub size_bytes: u64,
    /// Pool the entry belongs to.
    pub kind: CacheEntryKind,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last read-hit or insertion.
    pub last_accessed_at: DateTime<Utc>,
    /// Read-hits plus the insertion itself.
    pub access_count: u64,
    /// SHA-256 of materialised bytes when known.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Path of the materialised bytes relative to the cache root.
    #[serde(default)]
    pub location: Option<PathBuf>,
    /// Monotonic access sequence; breaks timestamp ties.
    #[serde(default)]
    pub(crate) access_seq: u64,
}

/// Point-in-time occupancy report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    /// Byte budget covered by this report.
    pub total_limit: u64,
    /// Bytes currently charged.
    pub used: u64,
    /// Remaining budget.
    pub available: u64,
    /// Entries covered by this report.
    pub entry_count: usize,
    /// Archive entries covered.
    pub archive_count: usize,
    /// File entries covered.
    pub file_count: usize,
    /// Creation time of the oldest entry.
    pub oldest_entry_time: Option<DateTime<Utc>>,
    /// Creation time of the newest entry.
    pub newest_entry_time: Option<DateTime<Utc>>,
}

impl CacheStatus {
    /// Fraction of the budget in use, in `0.0..=1.0` (or above when over budget).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.total_limit == 0 {
            0.0
        } else {
            self.used as f64 / self.total_limit as f64
        }
    }
}

/// What a cleanup or clear pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Entries removed.
    pub entries_removed: usize,
    /// Bytes reclaimed.
    pub bytes_removed: u64,
    /// Wall-clock time spent.
    pub duration: Duration,
}

impl CleanupReport {
    pub(crate) const fn absorb(&mut self, other: Self) {
        self.entries_removed += other.entries_removed;
        self.bytes_removed += other.bytes_removed;
    }
}
