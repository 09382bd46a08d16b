use thiserror::Error;
use vellum_authority::AuthorityError;
use vellum_scribe::{RetrievalFailure, ScribeError};
use vellum_store::StoreError;
use vellum_types::{EventId, TypeError};

/// Classification of an [`OracleError`] by how callers should react.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Out-of-order or gapped event ids. Fatal.
    ProtocolViolation,
    /// `create_new_partition` disagrees with the observed history. Fatal at connect.
    IntentConflict,
    /// Media content could not be retrieved.
    MediaRetrievalFailure,
    /// Local state disagrees with storage. Fatal.
    StorageIntegrity,
    /// No authority could be reached for the partition.
    UpstreamUnavailable,
    Other,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("protocol violation on {partition}: {reason}")]
    ProtocolViolation { partition: String, reason: String },

    #[error("event log for {partition} is not contiguous: expected event id {expected}, got {actual}")]
    EventLogGap {
        partition: String,
        expected: EventId,
        actual: EventId,
    },

    #[error("intent conflict on {partition}: {reason}")]
    IntentConflict { partition: String, reason: String },

    #[error("latest content of {} media on {partition} could not be retrieved", failures.len())]
    MediaRetrieval {
        partition: String,
        failures: Vec<RetrievalFailure>,
    },

    #[error("session for {0} has failed")]
    SessionFailed(String),

    #[error("session for {0} is not connected")]
    NotConnected(String),

    #[error("media {0} is not known to the partition")]
    UnknownMedia(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("scribe error: {0}")]
    Scribe(#[from] ScribeError),

    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

impl OracleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolViolation { .. } | Self::EventLogGap { .. } => ErrorKind::ProtocolViolation,
            Self::IntentConflict { .. } => ErrorKind::IntentConflict,
            Self::MediaRetrieval { .. } => ErrorKind::MediaRetrievalFailure,
            Self::Scribe(e) => match e {
                ScribeError::ProtocolViolation { .. } | ScribeError::MissingEventId { .. } => {
                    ErrorKind::ProtocolViolation
                }
                ScribeError::StorageIntegrity { .. } => ErrorKind::StorageIntegrity,
                ScribeError::Authority(e) => authority_kind(e),
                _ => ErrorKind::Other,
            },
            Self::Authority(e) => authority_kind(e),
            _ => ErrorKind::Other,
        }
    }

    /// Errors after which the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolViolation | ErrorKind::IntentConflict | ErrorKind::StorageIntegrity
        )
    }
}

fn authority_kind(error: &AuthorityError) -> ErrorKind {
    match error {
        AuthorityError::SchemeNotRegistered { .. }
        | AuthorityError::UpstreamUnavailable(_)
        | AuthorityError::Connection { .. } => ErrorKind::UpstreamUnavailable,
        AuthorityError::Retrieval { .. } => ErrorKind::MediaRetrievalFailure,
        _ => ErrorKind::Other,
    }
}

pub type OracleResult<T> = Result<T, OracleError>;
