#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    unreachable_pub
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! File- and environment-backed configuration for Stratum services.
//!
//! Layout: `model.rs` (typed sections), `defaults.rs` (default values),
//! `loader.rs` (YAML file plus `STRATUM_*` overrides), `validate.rs`
//! (cross-field checks run after every load).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, ConfigLoader};
pub use model::{
    ArchiveSource, CacheConfiguration, CleanupPolicy, HsmConfig, QueueConfig, StorageConfig,
    StratumConfig, TelemetryConfig,
};
