//! Operation queue and router: priority ordering, bounded concurrent
//! dispatch, cooperative cancellation, and progress reporting.

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

pub mod error;
pub mod queue;
pub mod router;

pub use error::{QueueError, QueueResult};
pub use queue::{OperationFilter, OperationQueue, QueueSettings, SubmitOptions};
pub use router::OperationRouter;
