//! Layered loading: defaults, then an optional YAML file, then `STRATUM_*` overrides.
//!
//! # Design
//! - The environment is captured once into a map so tests never mutate process state.
//! - Every load ends with [`StratumConfig::validate`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{CleanupPolicy, StratumConfig};

/// Variable naming the YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "STRATUM_CONFIG";

const ENV_PREFIX: &str = "STRATUM_";
const MAX_CONCURRENT_ENV: &str = "STRATUM_MAX_CONCURRENT";
const CACHE_DIR_ENV: &str = "STRATUM_CACHE_DIR";
const CACHE_POLICY_ENV: &str = "STRATUM_CACHE_POLICY";
const HSM_URL_ENV: &str = "STRATUM_HSM_URL";
const HSM_ACCOUNT_ENV: &str = "STRATUM_HSM_ACCOUNT";
const HSM_PASSWORD_ENV: &str = "STRATUM_HSM_PASSWORD";
const LOG_LEVEL_ENV: &str = "STRATUM_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "STRATUM_LOG_FORMAT";

/// Builder that resolves a [`StratumConfig`] from its sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// Loader with no file and no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader seeded from the process environment (`STRATUM_*` variables only).
    #[must_use]
    pub fn from_process_env() -> Self {
        let env: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        let file = env.get(CONFIG_PATH_ENV).map(PathBuf::from);
        Self { file, env }
    }

    /// Read this YAML file before applying overrides.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Add a single override as if it came from the environment.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Resolve and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, an override
    /// is malformed, or the merged result fails validation.
    pub fn load(&self) -> ConfigResult<StratumConfig> {
        let mut config = match &self.file {
            Some(path) => read_file(path)?,
            None => StratumConfig::default(),
        };
        self.apply_env(&mut config)?;
        config.validate()?;
        info!(
            file = ?self.file,
            max_concurrent = config.queue.max_concurrent,
            cache_dir = %config.cache.directory.display(),
            cache_policy = %config.cache.cleanup_policy,
            hsm_enabled = config.hsm.is_enabled(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn apply_env(&self, config: &mut StratumConfig) -> ConfigResult<()> {
        if let Some(raw) = self.env.get(MAX_CONCURRENT_ENV) {
            config.queue.max_concurrent = parse_env(MAX_CONCURRENT_ENV, raw, "expected integer")?;
        }
        if let Some(raw) = self.env.get(CACHE_DIR_ENV) {
            config.cache.directory = PathBuf::from(raw);
        }
        if let Some(raw) = self.env.get(CACHE_POLICY_ENV) {
            config.cache.cleanup_policy = CleanupPolicy::from_str(raw).map_err(|_| {
                ConfigError::Env {
                    name: CACHE_POLICY_ENV,
                    value: raw.clone(),
                    reason: "expected lru, size_only, or manual",
                }
            })?;
        }
        if let Some(raw) = self.env.get(HSM_URL_ENV) {
            config.hsm.api_url = Some(raw.clone());
        }
        if let Some(raw) = self.env.get(HSM_ACCOUNT_ENV) {
            config.hsm.account = Some(raw.clone());
        }
        if let Some(raw) = self.env.get(HSM_PASSWORD_ENV) {
            config.hsm.password = Some(raw.clone());
        }
        if let Some(raw) = self.env.get(LOG_LEVEL_ENV) {
            config.telemetry.level.clone_from(raw);
        }
        if let Some(raw) = self.env.get(LOG_FORMAT_ENV) {
            config.telemetry.format = Some(raw.clone());
        }
        debug!(overrides = self.env.len(), "environment overrides applied");
        Ok(())
    }
}

fn read_file(path: &Path) -> ConfigResult<StratumConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        operation: "config.read",
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(StratumConfig::default());
    }
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_env<T: FromStr>(name: &'static str, raw: &str, reason: &'static str) -> ConfigResult<T> {
    raw.trim().parse().map_err(|_| ConfigError::Env {
        name,
        value: raw.to_string(),
        reason,
    })
}
