//! Default values for every configuration section.
//!
//! # Design
//! - Keep defaults in one place so serde and tests agree.
//! - Sizes are bytes; intervals carry their unit in the name.

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Concurrent operations the queue dispatches.
pub const MAX_CONCURRENT: usize = 3;
/// Scheduler fallback recheck interval.
pub const IDLE_POLL_MS: u64 = 250;

/// Budget for cached archives.
pub const ARCHIVE_SIZE_LIMIT: u64 = 50 * GIB;
/// Budget for cached files.
pub const FILE_SIZE_LIMIT: u64 = 10 * GIB;
/// Directory name under the user cache directory.
pub const CACHE_DIR_NAME: &str = "stratum";

/// Longest a staging wait may take.
pub const STAGE_TIMEOUT_SECS: u64 = 180;
/// First delay between residency polls.
pub const POLL_INTERVAL_MS: u64 = 1_000;
/// Ceiling for the adaptive poll delay.
pub const MAX_POLL_INTERVAL_MS: u64 = 1_000;
/// Per-request HTTP timeout for the HSM API.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Log level used when neither the file nor `RUST_LOG` sets one.
pub const LOG_LEVEL: &str = "info";
