//! Byte-budgeted local cache for archives and extracted files.
//!
//! Entries are tracked in an index persisted as `cache_index.json` under the
//! cache root; materialised bytes live in `archives/` and `files/`. When an
//! insertion would exceed the budget the configured policy reclaims space
//! using an 80% trigger and a 70% target.

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

pub mod entry;
pub mod error;
mod eviction;
mod index;
pub mod store;

pub use entry::{CacheEntry, CacheStatus, CleanupReport};
pub use error::{CacheError, CacheResult};
pub use store::CacheStore;
pub use stratum_config::{CacheConfiguration, CleanupPolicy};
pub use stratum_core::CacheEntryKind;
