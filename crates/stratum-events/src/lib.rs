//! Event bus shared by the queue, staging, and cache services.
//!
//! Every published event gets a sequence number and is kept in a bounded
//! history. Readers either subscribe to the live feed or ask for what they
//! missed since an id, or for everything one operation produced.

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

pub mod payloads;
pub mod routing;

pub use payloads::{
    DEFAULT_HISTORY_CAPACITY, Event, EventEnvelope, EventId, OperationStatus,
};
pub use routing::{EventBus, EventStream};
