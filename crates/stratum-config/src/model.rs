//! Typed configuration sections.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratum_core::Priority;

use crate::defaults;
use crate::error::ConfigError;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StratumConfig {
    /// Operation queue settings.
    pub queue: QueueConfig,
    /// Local cache settings.
    pub cache: CacheConfiguration,
    /// HSM REST API settings.
    pub hsm: HsmConfig,
    /// Named storage locations and the archive catalog.
    pub storage: StorageConfig,
    /// Logging settings.
    pub telemetry: TelemetryConfig,
}

/// Operation queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Operations that may run at once.
    pub max_concurrent: usize,
    /// Priority applied when a submission does not specify one.
    pub default_priority: Priority,
    /// Fallback recheck interval for the scheduler, in milliseconds.
    pub idle_poll_ms: u64,
}

impl QueueConfig {
    /// Scheduler fallback interval.
    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::MAX_CONCURRENT,
            default_priority: Priority::Normal,
            idle_poll_ms: defaults::IDLE_POLL_MS,
        }
    }
}

/// How the cache reclaims space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Evict least recently accessed entries first.
    #[default]
    Lru,
    /// Evict largest entries first.
    SizeOnly,
    /// Never evict; reject insertions that exceed the budget.
    Manual,
}

impl CleanupPolicy {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::SizeOnly => "size_only",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "lru" => Ok(Self::Lru),
            "size_only" | "size" => Ok(Self::SizeOnly),
            "manual" => Ok(Self::Manual),
            _ => Err(ConfigError::invalid(
                "cache",
                "cleanup_policy",
                value,
                "unknown cleanup policy",
            )),
        }
    }
}

/// Local cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfiguration {
    /// Root directory; `archives/` and `files/` live beneath it.
    pub directory: PathBuf,
    /// Byte budget for archive entries.
    pub archive_size_limit: u64,
    /// Byte budget for file entries.
    pub file_size_limit: u64,
    /// Eviction policy.
    pub cleanup_policy: CleanupPolicy,
    /// Share one budget (the sum of both limits) across entry kinds.
    pub unified_cache: bool,
}

impl CacheConfiguration {
    /// Configuration rooted at `directory` with default budgets.
    #[must_use]
    pub fn at(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        let directory = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join(defaults::CACHE_DIR_NAME);
        Self {
            directory,
            archive_size_limit: defaults::ARCHIVE_SIZE_LIMIT,
            file_size_limit: defaults::FILE_SIZE_LIMIT,
            cleanup_policy: CleanupPolicy::Lru,
            unified_cache: false,
        }
    }
}

/// HSM REST API settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HsmConfig {
    /// Base URL of the API; staging is disabled when absent.
    pub api_url: Option<String>,
    /// Login account.
    pub account: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Longest a staging wait may take, in seconds.
    pub stage_timeout_secs: u64,
    /// First delay between residency polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Ceiling for the adaptive poll delay, in milliseconds.
    pub max_poll_interval_ms: u64,
    /// Per-request HTTP timeout, in seconds.
    pub request_timeout_secs: u64,
    /// Accept self-signed certificates.
    pub accept_invalid_certs: bool,
}

impl HsmConfig {
    /// Whether an API endpoint is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.api_url.is_some()
    }

    /// Staging deadline.
    #[must_use]
    pub const fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Initial poll delay.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll delay ceiling.
    #[must_use]
    pub const fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    /// HTTP request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            account: None,
            password: None,
            stage_timeout_secs: defaults::STAGE_TIMEOUT_SECS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            max_poll_interval_ms: defaults::MAX_POLL_INTERVAL_MS,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            accept_invalid_certs: false,
        }
    }
}

impl fmt::Debug for HsmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmConfig")
            .field("api_url", &self.api_url)
            .field("account", &self.account)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_poll_interval_ms", &self.max_poll_interval_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// Where an archive lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSource {
    /// Location name the archive is stored under.
    pub location: String,
    /// Path of the archive file inside that location.
    pub path: String,
}

/// Named storage locations and the archives transfers may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Location name to local root directory.
    pub locations: BTreeMap<String, PathBuf>,
    /// Archive identifier to source.
    pub archives: BTreeMap<String, ArchiveSource>,
    /// Ensure files are online before reading them when staging is enabled.
    pub stage_before_read: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            locations: BTreeMap::new(),
            archives: BTreeMap::new(),
            stage_before_read: true,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Default level filter.
    pub level: String,
    /// `json` or `pretty`; inferred from the build when absent.
    pub format: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: None,
        }
    }
}
