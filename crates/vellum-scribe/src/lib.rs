//! Local partition logs for Vellum.
//!
//! The scribe keeps, per partition, the authorized event log, the queue of
//! speculative commands and the media cache. All partitions share one blob
//! store of content-addressed buffers.
//!
//! # Key Types
//!
//! - [`Scribe`] -- shared storage, blob store, decoders and command counts
//! - [`ScribePartitionConnection`] -- one partition's log: narrate, claim, record truths
//! - [`BlobStore`] -- write-once buffers with persisted and in-memory ref counts
//! - [`RetrievalTracker`] -- coalesced, superseding content retrieval with retries
//! - [`Finalizers`] -- deferred media work run once an event is durable
//!
//! # Ordering Rules
//!
//! 1. A truth is recorded only at the next event id of the log.
//! 2. Commands occupy the contiguous ids right after the last truth.
//! 3. A truth for the queue head confirms it; any other truth purges the queue.

pub mod blob;
pub mod connection;
pub mod error;
pub mod finalizer;
pub mod retrieval;
pub mod scribe;

pub use blob::{BlobInfo, BlobStore};
pub use connection::{
    local_blob_url, ClaimedCommand, MediaInheritance, PartitionOptions, ScribePartitionConnection, TruthRecord,
    LOCAL_BLOB_URL_SCHEME,
};
pub use error::{ScribeError, ScribeResult};
pub use finalizer::{run_with_retries, FinalizerConfig, Finalizers};
pub use retrieval::{AttemptOutcome, RetrievalAttempt, RetrievalConfig, RetrievalFailure, RetrievalReport, RetrievalTracker};
pub use scribe::{Scribe, ScribeConfig};
