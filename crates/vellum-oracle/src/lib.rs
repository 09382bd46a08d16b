//! Reconciliation sessions for Vellum partitions.
//!
//! An [`OraclePartitionConnection`] joins a partition's local log with its
//! authority. It narrates history from up to three sources, applies
//! confirmed truths strictly in event id order, purges conflicting local
//! commands and routes media reads local-first.
//!
//! # Key Types
//!
//! - [`Oracle`] -- one session per partition URI, sharing a scribe and an authority nexus
//! - [`OraclePartitionConnection`] -- connect, narrate, claim, media reads
//! - [`NarrationPlan`] -- ordered narration sources with an explicit stop rule
//! - [`TruthQueue`] -- confirmed truths waiting for their turn
//! - [`FollowerEvent`] -- applied truths and purged commands, broadcast to followers
//! - [`OracleConfig`] -- TOML-loadable configuration
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> vellum_oracle::OracleResult<()> {
//! use vellum_oracle::{ConnectOptions, Oracle, OracleConfig};
//! use vellum_types::PartitionUri;
//!
//! let oracle = Oracle::new(OracleConfig::default()).await?;
//! let partition = PartitionUri::parse("vellum-local:///notes").unwrap();
//! let opts = ConnectOptions { create_new_partition: true, ..Default::default() };
//! let session = oracle.acquire_connection(&partition, opts).await?;
//! assert!(session.is_connected());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod follower;
pub mod oracle;
pub mod plan;
pub mod session;
pub mod truth_queue;

pub use config::{FollowerConfig, NarrationConfig, OracleConfig, StorageConfig};
pub use error::{ErrorKind, OracleError, OracleResult};
pub use follower::{FollowerEvent, FollowerStream, Followers};
pub use oracle::Oracle;
pub use plan::{NarrationPlan, NarrationRange, NarrationSource};
pub use session::{ConnectOptions, ConnectReport, OraclePartitionConnection, SessionState, TruthOrigin};
pub use truth_queue::{TruthQueue, TruthQueueEntry};
