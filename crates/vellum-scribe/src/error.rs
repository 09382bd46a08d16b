use thiserror::Error;
use vellum_authority::AuthorityError;
use vellum_store::StoreError;
use vellum_types::{EventId, TypeError};

/// Errors from the local partition logs and the blob store.
#[derive(Debug, Error)]
pub enum ScribeError {
    /// A storage operation failed.
    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// An event id broke the gap-free ordering of a partition log.
    #[error("protocol violation on {partition}: expected event id {expected}, got {actual}")]
    ProtocolViolation {
        partition: String,
        expected: EventId,
        actual: EventId,
    },

    /// A truth carries no position in the partition it was recorded into.
    #[error("event {command_id} has no event id for partition {partition}")]
    MissingEventId { partition: String, command_id: String },

    /// Local state disagrees with what storage holds.
    #[error("storage integrity error on {partition}: {reason}\n{state}")]
    StorageIntegrity {
        partition: String,
        reason: String,
        /// Dump of the log bounds and queue at the time of the failure.
        state: String,
    },

    #[error("partition {0} is frozen")]
    PartitionFrozen(String),

    #[error("media {0} is not known to the partition")]
    UnknownMedia(String),

    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

impl ScribeError {
    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Storage { operation, source }
    }

    pub(crate) fn integrity(partition: impl ToString, reason: impl Into<String>) -> Self {
        Self::StorageIntegrity {
            partition: partition.to_string(),
            reason: reason.into(),
            state: String::new(),
        }
    }
}

pub type ScribeResult<T> = Result<T, ScribeError>;
