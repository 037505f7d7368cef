//! Storage-agnostic operation model and the collaborator interfaces shared by
//! the queue, staging, cache, and filesystem crates.

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

pub mod cancel;
pub mod error;
pub mod model;
pub mod service;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use error::{CoreError, CoreResult};
pub use model::{
    BatchFileTransfer, BulkArchiveKind, BulkArchiveOperation, CacheEntryKind, DirectoryTransfer,
    EntryInfo, ExtractFilter, FileTransfer, MAX_CHUNK_SIZE, OperationId, OperationKind, OperationOutcome,
    OperationPayload, OperationSnapshot, Priority, ProgressCallback, ProgressUpdate, QueueStats,
};
pub use service::{ByteSink, ByteStream, OperationHandler, StorageCapability, StorageSink};
pub use stratum_events::OperationStatus;
