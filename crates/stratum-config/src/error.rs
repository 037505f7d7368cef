//! Error types for configuration loading and validation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Section that failed validation.
        section: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Offending value when available.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Environment override could not be parsed.
    #[error("invalid environment override")]
    Env {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Reading the configuration file failed.
    #[error("configuration io failure")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The configuration file was not valid YAML for the schema.
    #[error("configuration yaml failure")]
    Yaml {
        /// Path of the offending document.
        path: PathBuf,
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: &'static str,
        field: &'static str,
        value: impl ToString,
        reason: &'static str,
    ) -> Self {
        Self::InvalidField {
            section,
            field,
            value: Some(value.to_string()),
            reason,
        }
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn config_errors_keep_constant_messages() {
        let err = ConfigError::invalid("queue", "max_concurrent", 0, "must be at least 1");
        assert_eq!(err.to_string(), "invalid configuration field");
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                section: "queue",
                field: "max_concurrent",
                value: Some(ref v),
                ..
            } if v == "0"
        ));

        let io_err = ConfigError::Io {
            operation: "config.read",
            path: PathBuf::from("/etc/stratum.yaml"),
            source: io::Error::other("denied"),
        };
        assert_eq!(io_err.to_string(), "configuration io failure");
        assert!(io_err.source().is_some());
    }
}
