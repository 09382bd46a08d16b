use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use vellum_authority::ContentRetriever;
use vellum_types::{BlobId, EventId, MediaEntry};

use crate::error::ScribeResult;

/// Retry policy for truth finalizers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    /// Retries after the first failed run.
    pub retries: u32,
    /// The n-th retry waits `n * backoff_base_ms` milliseconds.
    pub backoff_base_ms: u64,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            retries: 4,
            backoff_base_ms: 5000,
        }
    }
}

impl FinalizerConfig {
    /// A single immediate retry.
    pub fn single_retry() -> Self {
        Self {
            retries: 1,
            backoff_base_ms: 0,
        }
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(u64::from(retry)))
    }
}

/// Deferred work for one media sub-action of an event.
///
/// Runs after the owning event is durable: fetches missing content, moves
/// blob references from the previous blob to the new one and writes the
/// media row. Each step runs once even when the finalizer is retried.
///
/// Finalizers of queued commands only fetch content. References and rows
/// follow authorized truths alone, so a purge leaves nothing to undo.
pub(crate) struct MediaFinalizer {
    pub(crate) entry: MediaEntry,
    pub(crate) previous_blob: Option<BlobId>,
    pub(crate) retriever: Option<Arc<dyn ContentRetriever>>,
    pub(crate) fetch_only: bool,
    refs_moved: AtomicBool,
    row_written: AtomicBool,
}

impl MediaFinalizer {
    pub(crate) fn new(
        entry: MediaEntry,
        previous_blob: Option<BlobId>,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> Self {
        Self {
            entry,
            previous_blob,
            retriever,
            fetch_only: false,
            refs_moved: AtomicBool::new(false),
            row_written: AtomicBool::new(false),
        }
    }

    pub(crate) fn fetch_only(entry: MediaEntry, retriever: Option<Arc<dyn ContentRetriever>>) -> Self {
        Self {
            fetch_only: true,
            ..Self::new(entry, None, retriever)
        }
    }

    pub(crate) fn refs_moved(&self) -> bool {
        self.refs_moved.load(Ordering::Acquire)
    }

    pub(crate) fn mark_refs_moved(&self) {
        self.refs_moved.store(true, Ordering::Release);
    }

    pub(crate) fn row_written(&self) -> bool {
        self.row_written.load(Ordering::Acquire)
    }

    pub(crate) fn mark_row_written(&self) {
        self.row_written.store(true, Ordering::Release);
    }
}

/// The finalizers of one event, in media sub-action order.
#[derive(Default)]
pub struct Finalizers {
    pub(crate) event_id: EventId,
    pub(crate) media: Vec<MediaFinalizer>,
}

impl Finalizers {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn len(&self) -> usize {
        self.media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
    }
}

impl std::fmt::Debug for Finalizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let medias: Vec<String> = self
            .media
            .iter()
            .map(|m| m.entry.media_id.to_string())
            .collect();
        f.debug_struct("Finalizers")
            .field("event_id", &self.event_id)
            .field("medias", &medias)
            .finish()
    }
}

/// Run `op` until it succeeds or the retries of `config` are used up,
/// waiting a linearly growing backoff between runs.
pub async fn run_with_retries<F, Fut>(config: &FinalizerConfig, what: &str, mut op: F) -> ScribeResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ScribeResult<()>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if retry < config.retries => {
                retry += 1;
                let delay = config.backoff(retry);
                warn!(what, retry, delay_ms = delay.as_millis() as u64, error = %e, "finalizer failed; retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScribeError;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_is_linear() {
        let config = FinalizerConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(5));
        assert_eq!(config.backoff(4), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = FinalizerConfig {
            retries: 4,
            backoff_base_ms: 0,
        };
        run_with_retries(&config, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(ScribeError::UnknownMedia("m".into()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_configured_retries() {
        let calls = AtomicU32::new(0);
        let err = run_with_retries(&FinalizerConfig::single_retry(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ScribeError::UnknownMedia("m".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ScribeError::UnknownMedia(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_retries() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        run_with_retries(&FinalizerConfig::default(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ScribeError::UnknownMedia("m".into()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(15));
    }
}
