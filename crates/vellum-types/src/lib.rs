//! Foundation types for Vellum.
//!
//! Vellum is the partition event-sourcing core of a reactive object-graph
//! runtime. Every other Vellum crate depends on `vellum-types`.
//!
//! # Key Types
//!
//! - [`PartitionUri`] -- `scheme://authority/rawId[?query]` address of a partition
//! - [`Event`] -- an authorized truth or a speculative command
//! - [`Action`] -- the mutation an event carries (possibly compound)
//! - [`CommandId`] -- UUID v7 identifier shared by a command and its truth
//! - [`EventLogInfo`] / [`CommandQueueInfo`] -- authorized and speculative bounds
//! - [`BlobId`] -- BLAKE3 content hash of an immutable byte buffer
//! - [`MediaInfo`] / [`MediaEntry`] -- logical media and their current blob

pub mod blob;
pub mod error;
pub mod event;
pub mod media;
pub mod uri;

pub use blob::BlobId;
pub use error::TypeError;
pub use event::{Action, CommandId, CommandQueueInfo, Event, EventId, EventLogInfo};
pub use media::{MediaEntry, MediaId, MediaInfo, MediaType, MediaUpdate, MediaUpdateKind};
pub use uri::PartitionUri;
