//! Cross-field validation run after every load.

use crate::error::{ConfigError, ConfigResult};
use crate::model::{CacheConfiguration, HsmConfig, QueueConfig, StorageConfig, StratumConfig};

impl StratumConfig {
    /// Check every section, returning the first violation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] naming the offending section and field.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_queue(&self.queue)?;
        validate_cache(&self.cache)?;
        validate_hsm(&self.hsm)?;
        validate_storage(&self.storage)
    }
}

fn validate_queue(queue: &QueueConfig) -> ConfigResult<()> {
    if queue.max_concurrent == 0 {
        return Err(ConfigError::invalid(
            "queue",
            "max_concurrent",
            queue.max_concurrent,
            "must be at least 1",
        ));
    }
    if queue.idle_poll_ms == 0 {
        return Err(ConfigError::invalid(
            "queue",
            "idle_poll_ms",
            queue.idle_poll_ms,
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_cache(cache: &CacheConfiguration) -> ConfigResult<()> {
    if cache.directory.as_os_str().is_empty() {
        return Err(ConfigError::InvalidField {
            section: "cache",
            field: "directory",
            value: None,
            reason: "must not be empty",
        });
    }
    if cache.archive_size_limit == 0 {
        return Err(ConfigError::invalid(
            "cache",
            "archive_size_limit",
            cache.archive_size_limit,
            "must be positive",
        ));
    }
    if cache.file_size_limit == 0 {
        return Err(ConfigError::invalid(
            "cache",
            "file_size_limit",
            cache.file_size_limit,
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_hsm(hsm: &HsmConfig) -> ConfigResult<()> {
    if let Some(url) = &hsm.api_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(ConfigError::invalid(
            "hsm",
            "api_url",
            url,
            "must be an http or https url",
        ));
    }
    let positive = [
        ("stage_timeout_secs", hsm.stage_timeout_secs),
        ("poll_interval_ms", hsm.poll_interval_ms),
        ("max_poll_interval_ms", hsm.max_poll_interval_ms),
        ("request_timeout_secs", hsm.request_timeout_secs),
    ];
    if let Some((field, value)) = positive.into_iter().find(|(_, value)| *value == 0) {
        return Err(ConfigError::invalid("hsm", field, value, "must be positive"));
    }
    if hsm.max_poll_interval_ms < hsm.poll_interval_ms {
        return Err(ConfigError::invalid(
            "hsm",
            "max_poll_interval_ms",
            hsm.max_poll_interval_ms,
            "must not be below poll_interval_ms",
        ));
    }
    Ok(())
}

fn validate_storage(storage: &StorageConfig) -> ConfigResult<()> {
    for (name, root) in &storage.locations {
        if name.trim().is_empty() || root.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "storage",
                "locations",
                name,
                "location name and root must not be empty",
            ));
        }
    }
    for (id, source) in &storage.archives {
        if !storage.locations.contains_key(&source.location) {
            return Err(ConfigError::invalid(
                "storage",
                "archives",
                id,
                "references an unknown location",
            ));
        }
        if source.path.trim().is_empty() {
            return Err(ConfigError::invalid(
                "storage",
                "archives",
                id,
                "path must not be empty",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArchiveSource;
    use std::path::PathBuf;

    fn field_of(err: &ConfigError) -> Option<&'static str> {
        match err {
            ConfigError::InvalidField { field, .. } => Some(*field),
            _ => None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(StratumConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = StratumConfig::default();
        config.queue.max_concurrent = 0;
        let err = config.validate().expect_err("zero concurrency");
        assert_eq!(field_of(&err), Some("max_concurrent"));
    }

    #[test]
    fn rejects_empty_cache_directory_and_zero_limits() {
        let mut config = StratumConfig::default();
        config.cache.directory = PathBuf::new();
        assert_eq!(
            field_of(&config.validate().expect_err("empty dir")),
            Some("directory")
        );

        let mut config = StratumConfig::default();
        config.cache.file_size_limit = 0;
        assert_eq!(
            field_of(&config.validate().expect_err("zero limit")),
            Some("file_size_limit")
        );
    }

    #[test]
    fn rejects_inverted_poll_bounds_and_bad_urls() {
        let mut config = StratumConfig::default();
        config.hsm.poll_interval_ms = 2_000;
        config.hsm.max_poll_interval_ms = 1_000;
        assert_eq!(
            field_of(&config.validate().expect_err("inverted")),
            Some("max_poll_interval_ms")
        );

        let mut config = StratumConfig::default();
        config.hsm.api_url = Some("ftp://hsm".into());
        assert_eq!(
            field_of(&config.validate().expect_err("scheme")),
            Some("api_url")
        );

        let mut config = StratumConfig::default();
        config.hsm.stage_timeout_secs = 0;
        assert_eq!(
            field_of(&config.validate().expect_err("timeout")),
            Some("stage_timeout_secs")
        );
    }

    #[test]
    fn rejects_archives_in_unknown_locations() {
        let mut config = StratumConfig::default();
        config
            .storage
            .locations
            .insert("tape".into(), PathBuf::from("/hsm/esm"));
        config.storage.archives.insert(
            "run-1".into(),
            ArchiveSource {
                location: "tape".into(),
                path: "run-1.tar".into(),
            },
        );
        assert!(config.validate().is_ok());

        config.storage.archives.insert(
            "run-2".into(),
            ArchiveSource {
                location: "disk".into(),
                path: "run-2.tar".into(),
            },
        );
        assert_eq!(
            field_of(&config.validate().expect_err("unknown location")),
            Some("archives")
        );
    }
}
