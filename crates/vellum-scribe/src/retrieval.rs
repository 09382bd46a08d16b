use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vellum_authority::ContentRetriever;
use vellum_types::{MediaId, MediaInfo};

/// Retry policy for media content retrieval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Attempts per request before the request fails for good.
    pub max_attempts: u32,
    /// Attempts remembered per media id.
    pub history_limit: usize,
    /// Pause between attempts of one request, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            history_limit: 32,
            retry_delay_ms: 0,
        }
    }
}

impl RetrievalConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// How one attempt ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
    /// A newer request for the same media took over.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RetrievalAttempt {
    /// Sequence number of the request this attempt belongs to.
    pub request: u64,
    /// 1-based attempt number within the request; 0 for a request that was
    /// skipped before its first attempt.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// The request gave up after this attempt.
    pub terminal: bool,
}

/// A failed attempt, as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RetrievalFailure {
    pub media_id: MediaId,
    pub request: u64,
    pub attempt: u32,
    pub error: String,
}

/// Failures observed so far, classified per media.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetrievalReport {
    /// Failures on the most recent attempt of a media.
    pub latest_failures: Vec<RetrievalFailure>,
    /// Earlier failures; never fatal.
    pub intermediate_failures: Vec<RetrievalFailure>,
    /// Attempts beyond the first of each request.
    pub overall_retries: u64,
}

#[derive(Default)]
struct MediaRetrievals {
    history: VecDeque<RetrievalAttempt>,
    latest_request: u64,
    /// Held by the request currently retrieving this media.
    pending: Arc<tokio::sync::Mutex<()>>,
}

/// Coalesces, supersedes and retries media content retrievals.
///
/// Requests for one media id run one at a time in arrival order. A request
/// that is no longer the newest for its media stops retrying, records itself
/// as skipped and yields `None`. A request that exhausts its attempts records
/// a terminal failure and yields `None` instead of an error; callers decide
/// through [`RetrievalTracker::report`] whether that failure is fatal.
pub struct RetrievalTracker {
    config: RetrievalConfig,
    medias: Mutex<HashMap<MediaId, MediaRetrievals>>,
    overall_retries: AtomicU64,
}

impl RetrievalTracker {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            medias: Mutex::new(HashMap::new()),
            overall_retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve the content of `media_id` with retries.
    pub async fn retrieve(
        &self,
        media_id: &MediaId,
        info: &MediaInfo,
        retriever: &dyn ContentRetriever,
    ) -> Option<Bytes> {
        let (request, pending) = {
            let mut medias = self.medias.lock().expect("lock poisoned");
            let media = medias.entry(media_id.clone()).or_default();
            media.latest_request += 1;
            (media.latest_request, Arc::clone(&media.pending))
        };
        let _turn = pending.lock().await;

        if self.is_superseded(media_id, request) {
            self.record(media_id, request, 0, AttemptOutcome::Skipped, false);
            debug!(%media_id, request, "retrieval superseded before first attempt");
            return None;
        }

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let result = retriever.retrieve(media_id, info).await;
            let superseded = self.is_superseded(media_id, request);
            match result {
                Ok(content) if !superseded => {
                    self.record(media_id, request, attempt, AttemptOutcome::Succeeded, false);
                    return content;
                }
                Ok(_) => {
                    self.record(media_id, request, attempt, AttemptOutcome::Skipped, false);
                    debug!(%media_id, request, attempt, "retrieval superseded");
                    return None;
                }
                Err(e) => {
                    let terminal = !superseded && attempt == max_attempts;
                    self.record(
                        media_id,
                        request,
                        attempt,
                        AttemptOutcome::Failed(e.to_string()),
                        terminal,
                    );
                    if superseded {
                        debug!(%media_id, request, attempt, error = %e, "retrieval superseded after failure");
                        return None;
                    }
                    if terminal {
                        warn!(%media_id, request, attempts = attempt, error = %e, "media retrieval failed");
                        return None;
                    }
                    self.overall_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(%media_id, request, attempt, error = %e, "retrying media retrieval");
                    let delay = self.config.retry_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay * attempt).await;
                    }
                }
            }
        }
        None
    }

    fn is_superseded(&self, media_id: &MediaId, request: u64) -> bool {
        self.medias
            .lock()
            .expect("lock poisoned")
            .get(media_id)
            .is_some_and(|media| media.latest_request != request)
    }

    fn record(&self, media_id: &MediaId, request: u64, attempt: u32, outcome: AttemptOutcome, terminal: bool) {
        let mut medias = self.medias.lock().expect("lock poisoned");
        let media = medias.entry(media_id.clone()).or_default();
        media.history.push_back(RetrievalAttempt {
            request,
            attempt,
            outcome,
            terminal,
        });
        while media.history.len() > self.config.history_limit.max(1) {
            media.history.pop_front();
        }
    }

    /// Attempts remembered for `media_id`, oldest first.
    pub fn history(&self, media_id: &MediaId) -> Vec<RetrievalAttempt> {
        self.medias
            .lock()
            .expect("lock poisoned")
            .get(media_id)
            .map(|media| media.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Classify every remembered failure.
    ///
    /// Only a failure on the last remembered attempt of a media is a latest
    /// failure; every other failure is intermediate.
    pub fn report(&self) -> RetrievalReport {
        let medias = self.medias.lock().expect("lock poisoned");
        let mut report = RetrievalReport {
            overall_retries: self.overall_retries.load(Ordering::Relaxed),
            ..Default::default()
        };
        let mut ids: Vec<&MediaId> = medias.keys().collect();
        ids.sort();
        for media_id in ids {
            let history = &medias[media_id].history;
            let last_index = history.len().checked_sub(1);
            for (index, attempt) in history.iter().enumerate() {
                let AttemptOutcome::Failed(error) = &attempt.outcome else {
                    continue;
                };
                let failure = RetrievalFailure {
                    media_id: media_id.clone(),
                    request: attempt.request,
                    attempt: attempt.attempt,
                    error: error.clone(),
                };
                if Some(index) == last_index {
                    report.latest_failures.push(failure);
                } else {
                    report.intermediate_failures.push(failure);
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for RetrievalTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalTracker")
            .field("config", &self.config)
            .field("overall_retries", &self.overall_retries.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;
    use vellum_authority::{AuthorityError, AuthorityResult};

    /// Fails the first `failures` calls, then returns `content`.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        content: Bytes,
    }

    #[async_trait]
    impl ContentRetriever for Flaky {
        async fn retrieve(&self, media_id: &MediaId, _info: &MediaInfo) -> AuthorityResult<Option<Bytes>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AuthorityError::Retrieval {
                    media_id: media_id.to_string(),
                    reason: format!("failure {}", call + 1),
                });
            }
            Ok(Some(self.content.clone()))
        }
    }

    /// The first call blocks until released; later calls fail.
    struct Gated {
        release: Notify,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContentRetriever for Gated {
        async fn retrieve(&self, media_id: &MediaId, _info: &MediaInfo) -> AuthorityResult<Option<Bytes>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.release.notified().await;
                return Ok(Some(Bytes::from_static(b"slow")));
            }
            Err(AuthorityError::Retrieval {
                media_id: media_id.to_string(),
                reason: "unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn two_failures_then_success_within_three_attempts() {
        let tracker = RetrievalTracker::new(RetrievalConfig::default());
        let retriever = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            content: Bytes::from_static(b"content"),
        };
        let media = MediaId::new("m1");
        let content = tracker
            .retrieve(&media, &MediaInfo::default(), &retriever)
            .await;
        assert_eq!(content.as_deref(), Some(&b"content"[..]));

        let report = tracker.report();
        assert_eq!(report.overall_retries, 2);
        assert!(report.latest_failures.is_empty());
        assert_eq!(report.intermediate_failures.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_request_is_a_latest_failure() {
        let tracker = RetrievalTracker::new(RetrievalConfig::default());
        let retriever = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            content: Bytes::new(),
        };
        let media = MediaId::new("m1");
        assert_eq!(tracker.retrieve(&media, &MediaInfo::default(), &retriever).await, None);

        let report = tracker.report();
        assert_eq!(report.latest_failures.len(), 1);
        assert_eq!(report.latest_failures[0].attempt, 3);
        assert_eq!(report.intermediate_failures.len(), 2);
        assert!(tracker.history(&media).last().unwrap().terminal);

        // A fresh request starts counting from one again and its success
        // downgrades the earlier failures.
        let retriever = Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            content: Bytes::from_static(b"ok"),
        };
        assert!(tracker.retrieve(&media, &MediaInfo::default(), &retriever).await.is_some());
        let report = tracker.report();
        assert!(report.latest_failures.is_empty());
        assert_eq!(report.intermediate_failures.len(), 3);
        assert_eq!(tracker.history(&media).last().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn newer_requests_supersede_pending_ones() {
        let tracker = Arc::new(RetrievalTracker::new(RetrievalConfig::default()));
        let retriever = Arc::new(Gated {
            release: Notify::new(),
            calls: AtomicU32::new(0),
        });
        let media = MediaId::new("m1");

        let spawn = |tracker: Arc<RetrievalTracker>, retriever: Arc<Gated>, media: MediaId| {
            tokio::spawn(async move {
                tracker
                    .retrieve(&media, &MediaInfo::default(), retriever.as_ref())
                    .await
            })
        };

        let first = spawn(Arc::clone(&tracker), Arc::clone(&retriever), media.clone());
        while retriever.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = spawn(Arc::clone(&tracker), Arc::clone(&retriever), media.clone());
        let third = spawn(Arc::clone(&tracker), Arc::clone(&retriever), media.clone());
        while tracker.medias.lock().unwrap()[&media].latest_request < 3 {
            tokio::task::yield_now().await;
        }
        retriever.release.notify_one();

        assert_eq!(first.await.unwrap(), None);
        assert_eq!(second.await.unwrap(), None);
        assert_eq!(third.await.unwrap(), None);

        let history = tracker.history(&media);
        let outcome_of = |request: u64| -> Vec<AttemptOutcome> {
            history
                .iter()
                .filter(|a| a.request == request)
                .map(|a| a.outcome.clone())
                .collect()
        };
        assert_eq!(outcome_of(1), vec![AttemptOutcome::Skipped]);
        assert_eq!(outcome_of(2), vec![AttemptOutcome::Skipped]);
        let third_attempts = outcome_of(3);
        assert_eq!(third_attempts.len(), 3);
        assert!(third_attempts
            .iter()
            .all(|o| matches!(o, AttemptOutcome::Failed(_))));
        assert!(history.last().unwrap().terminal);
        // Only the request that ran to completion counted retries.
        assert_eq!(tracker.report().overall_retries, 2);
    }
}
