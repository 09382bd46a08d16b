//! Local durable storage for Vellum.
//!
//! Every partition owns three logical tables and all partitions share two:
//!
//! | Table | Key | Contents |
//! |---|---|---|
//! | `events` (per partition) | event id | authorized truths |
//! | `commands` (per partition) | event id | speculative commands |
//! | `medias` (per partition) | media id | media → blob associations |
//! | `blobs` (shared) | blob id | byte length, persisted ref count |
//! | `buffers` (shared) | blob id | raw bytes |
//!
//! # Storage Backends
//!
//! All backends implement the [`LocalStorage`] trait:
//!
//! - [`InMemoryStorage`] -- map-based store for tests, transient sessions and embedding
//! - [`FileStorage`] -- the same tables recovered from a CRC-framed journal file
//!
//! # Design Rules
//!
//! 1. Writes go through [`StorageBatch`]; a batch is applied atomically.
//! 2. Reads of a missing row return `Ok(None)`, never an error.
//! 3. The store never interprets events or ref counts; callers own the semantics.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod batch;
pub mod error;
pub mod file;
pub mod memory;
mod tables;
pub mod traits;

pub use batch::{BlobRow, LogTable, MediaRow, StorageBatch, StorageOp};
pub use error::{StoreError, StoreResult};
pub use file::{FileStorage, JournalConfig, SyncMode};
pub use memory::InMemoryStorage;
pub use traits::LocalStorage;
