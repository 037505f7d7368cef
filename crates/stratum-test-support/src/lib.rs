#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    unreachable_pub
)]

//! Shared test helpers used across integration suites.
//! Layout: fixtures.rs (temp trees, payload builders), mocks.rs (in-memory storage, scripted handlers), assert.rs (async assertions).

pub mod assert;
pub mod fixtures;
pub mod mocks;

pub use assert::eventually;
pub use fixtures::{bulk_archive, file_transfer, temp_dir, write_file};
pub use mocks::{MemoryStorage, ScriptedHandler};
