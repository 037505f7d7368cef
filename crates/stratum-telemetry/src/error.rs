//! # Design
//!
//! - Metric failures carry the metric name and the stage that failed.
//! - Rendering failures keep encoder and UTF-8 problems apart.

use thiserror::Error;

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Stage of metric setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStage {
    /// Building the collector from its options.
    Build,
    /// Adding the collector to the registry.
    Register,
}

/// Errors raised while installing logging or handling metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber is already installed.
    #[error("tracing subscriber already installed")]
    SubscriberInstall {
        /// Underlying install error.
        source: tracing_subscriber::util::TryInitError,
    },
    /// A metric could not be built or registered.
    #[error("metric setup failed")]
    Metric {
        /// Metric name.
        name: &'static str,
        /// Failing stage.
        stage: MetricStage,
        /// Underlying Prometheus error.
        source: prometheus::Error,
    },
    /// The registry could not be encoded.
    #[error("metrics encoding failed")]
    MetricsEncode {
        /// Underlying Prometheus error.
        source: prometheus::Error,
    },
    /// Encoded metrics were not UTF-8.
    #[error("metrics encoding failed")]
    MetricsUtf8 {
        /// Underlying conversion error.
        source: std::string::FromUtf8Error,
    },
}
