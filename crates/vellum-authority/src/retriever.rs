use async_trait::async_trait;
use bytes::Bytes;
use vellum_types::{MediaId, MediaInfo};

use crate::error::{AuthorityError, AuthorityResult};

/// Fetches the bytes of a media from wherever its content lives.
///
/// `Ok(None)` means the source has no content for the media. Errors are
/// retried by the caller's retrieval tracker.
#[async_trait]
pub trait ContentRetriever: Send + Sync {
    async fn retrieve(&self, media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<Bytes>>;
}

/// Retriever used while no remote authority is resolved.
///
/// Every actual fetch fails with [`AuthorityError::UpstreamUnavailable`].
#[derive(Clone, Debug, Default)]
pub struct UnavailableRetriever {
    reason: String,
}

impl UnavailableRetriever {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl ContentRetriever for UnavailableRetriever {
    async fn retrieve(&self, media_id: &MediaId, _info: &MediaInfo) -> AuthorityResult<Option<Bytes>> {
        let reason = if self.reason.is_empty() {
            "no authority connection"
        } else {
            &self.reason
        };
        Err(AuthorityError::UpstreamUnavailable(format!(
            "cannot retrieve media {media_id}: {reason}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_retriever_always_fails() {
        let retriever = UnavailableRetriever::new("partition not yet connected");
        let err = retriever
            .retrieve(&MediaId::new("m1"), &MediaInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::UpstreamUnavailable(ref msg) if msg.contains("m1")));
    }
}
