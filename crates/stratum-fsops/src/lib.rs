//! Local filesystem storage and the transfer and archive handlers the
//! operation queue dispatches to.
//!
//! Locations are named local roots. [`TransferHandler`] copies files, batches,
//! and directory trees between them; [`ArchiveHandler`] copies, moves, or
//! extracts catalogued archives, reading each through the cache.

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

pub mod archive;
mod batch;
pub mod error;
pub mod extract;
pub mod local;
pub mod rules;
pub mod transfer;

pub use archive::{ArchiveCatalog, ArchiveEngine, ArchiveHandler, archive_cache_key};
pub use error::{FsOpsError, FsOpsResult};
pub use extract::{ArchiveFormat, ExtractReport, extract_archive, sanitize_archive_path};
pub use local::{LocalStorage, Locations};
pub use rules::RuleSet;
pub use transfer::{DEFAULT_CHUNK_SIZE, TransferEngine, TransferHandler};
