//! Authority routing for Vellum.
//!
//! A partition's truths come either from a remote authority or from the
//! partition itself. This crate holds the seams between the local partition
//! machinery and whatever serves a partition remotely.
//!
//! # Key Types
//!
//! - [`AuthorityNexus`] -- scheme → module registry; memoizes one authority per authority URI
//! - [`SchemeModule`] / [`Authority`] -- factories for remote partition connections
//! - [`AuthorityConnection`] -- chronicle commands, stream truths, read media
//! - [`AuthorityRoute`] -- `Remote(connection)` or `Local`
//! - [`ContentRetriever`] -- fetches media bytes for retrieval with retries
//! - [`DecoderArray`] -- `(type, subtype)` → content decoder lookup with fallback
//!
//! # Built-in Schemes
//!
//! - `vellum-local` ([`LocalSchemeModule`]) -- partitions authorize themselves
//! - `vellum-memory` ([`InMemorySchemeModule`]) -- in-process authority for tests and embedding

pub mod authority;
pub mod backend;
pub mod decoder;
pub mod error;
pub mod local;
pub mod memory;
pub mod nexus;
pub mod retriever;

pub use authority::{Authority, AuthorityConfig, AuthorityRoute, SchemeModule};
pub use backend::{AuthorityConnection, EventCallback, NarrateOptions, Narration, PartitionBackend};
pub use decoder::{DecodeContext, Decoder, DecoderArray, JsonDecoder, TextDecoder};
pub use error::{AuthorityError, AuthorityResult};
pub use local::{LocalSchemeModule, LOCAL_SCHEME};
pub use memory::{InMemoryAuthority, InMemoryAuthorityConnection, InMemorySchemeModule, MEMORY_SCHEME};
pub use nexus::AuthorityNexus;
pub use retriever::{ContentRetriever, UnavailableRetriever};
