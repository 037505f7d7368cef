//! HSM staging: the REST client, filesystem resolution, the staging
//! controller, and a storage wrapper that stages before reading.

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

pub mod api;
pub mod client;
pub mod controller;
pub mod error;
pub mod resolve;
pub mod storage;

pub use api::{BlockStatus, Filesystem, HsmApi};
pub use client::HsmClient;
pub use controller::{StagingController, StagingSettings};
pub use error::{StagingError, StagingResult};
pub use resolve::resolve_filesystem;
pub use storage::{HSM_METADATA_KEY, StagedStorage};
