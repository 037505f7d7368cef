//! Stratum application bootstrap wiring.
//!
//! Layout: `cli.rs` (arguments and payload files), `bootstrap.rs` (service
//! graph and run loop), `error.rs`.

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

/// Service graph construction and the run loop.
pub mod bootstrap;
/// Command-line arguments.
pub mod cli;
/// Application errors.
pub mod error;

pub use bootstrap::{Services, run_app, run_until};
pub use cli::Cli;
pub use error::{AppError, AppResult};
