use thiserror::Error;
use vellum_types::{BlobId, TypeError};

/// Errors from authority routing, remote connections and content decoding.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("no scheme module registered for {scheme:?} (partition {uri})")]
    SchemeNotRegistered { scheme: String, uri: String },

    #[error("a scheme module for {0:?} is already registered")]
    SchemeAlreadyRegistered(String),

    #[error("authority {0} is local and has no remote connection")]
    NotRemote(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("connection to {uri} failed: {reason}")]
    Connection { uri: String, reason: String },

    #[error("command {command_id} rejected: {reason}")]
    Rejected { command_id: String, reason: String },

    #[error("retrieval of media {media_id} failed: {reason}")]
    Retrieval { media_id: String, reason: String },

    #[error("blob {0} is not stored by the authority")]
    BlobNotFound(BlobId),

    #[error("decoder {decoder} failed: {reason}")]
    Decode { decoder: String, reason: String },

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;
