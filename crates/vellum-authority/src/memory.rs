use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;
use vellum_types::{BlobId, Event, EventId, MediaId, MediaInfo, PartitionUri};

use crate::authority::{Authority, AuthorityConfig, SchemeModule};
use crate::backend::{AuthorityConnection, NarrateOptions, Narration, PartitionBackend};
use crate::error::{AuthorityError, AuthorityResult};
use crate::retriever::ContentRetriever;

/// Scheme served by [`InMemorySchemeModule`].
pub const MEMORY_SCHEME: &str = "vellum-memory";

const TRUTH_CHANNEL_CAPACITY: usize = 1024;

struct PartitionLog {
    truths: Vec<Event>,
    sender: broadcast::Sender<Event>,
    narrations: usize,
    chronicled: usize,
}

impl PartitionLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(TRUTH_CHANNEL_CAPACITY);
        Self {
            truths: Vec::new(),
            sender,
            narrations: 0,
            chronicled: 0,
        }
    }

    fn next_event_id(&self) -> EventId {
        self.truths.len() as EventId
    }
}

#[derive(Default)]
struct AuthorityState {
    partitions: HashMap<PartitionUri, PartitionLog>,
    blobs: HashMap<BlobId, Bytes>,
    scripted_failures: HashMap<MediaId, u32>,
    retrieval_attempts: HashMap<MediaId, u32>,
}

impl AuthorityState {
    fn log_mut(&mut self, partition: &PartitionUri) -> &mut PartitionLog {
        self.partitions
            .entry(partition.clone())
            .or_insert_with(PartitionLog::new)
    }

    fn append_truth(&mut self, partition: &PartitionUri, event: &Event) -> Event {
        let log = self.log_mut(partition);
        let truth = event.clone().with_event_id(partition, log.next_event_id());
        log.truths.push(truth.clone());
        // No subscribers is fine; late subscribers narrate instead.
        let _ = log.sender.send(truth.clone());
        truth
    }

    fn retrieve(&mut self, media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<Bytes>> {
        *self.retrieval_attempts.entry(media_id.clone()).or_default() += 1;
        if let Some(remaining) = self.scripted_failures.get_mut(media_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AuthorityError::Retrieval {
                    media_id: media_id.to_string(),
                    reason: "scripted failure".into(),
                });
            }
        }
        Ok(info.blob_id.and_then(|blob_id| self.blobs.get(&blob_id).cloned()))
    }
}

/// In-process authority for tests and embedding.
///
/// Keeps the authorized truths of every partition under one authority URI,
/// assigns consecutive event ids (starting at 0) to chronicled commands,
/// broadcasts every truth and stores blobs. Retrievals of a media can be
/// scripted to fail a number of times.
pub struct InMemoryAuthority {
    authority_uri: String,
    state: Arc<Mutex<AuthorityState>>,
}

impl InMemoryAuthority {
    pub fn new(authority_uri: impl Into<String>) -> Self {
        Self {
            authority_uri: authority_uri.into(),
            state: Arc::new(Mutex::new(AuthorityState::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AuthorityState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Authorize `event` as the next truth of `partition`, as if another
    /// client had chronicled it.
    pub fn push_truth(&self, partition: &PartitionUri, event: &Event) -> Event {
        self.state().append_truth(partition, event)
    }

    pub fn truths(&self, partition: &PartitionUri) -> Vec<Event> {
        self.state()
            .partitions
            .get(partition)
            .map(|log| log.truths.clone())
            .unwrap_or_default()
    }

    pub fn store_blob(&self, content: Bytes) -> BlobId {
        let blob_id = BlobId::for_content(&content);
        self.state().blobs.insert(blob_id, content);
        blob_id
    }

    /// Make the next `times` retrievals of `media_id` fail.
    pub fn fail_retrievals(&self, media_id: &MediaId, times: u32) {
        self.state().scripted_failures.insert(media_id.clone(), times);
    }

    pub fn retrieval_attempts(&self, media_id: &MediaId) -> u32 {
        self.state()
            .retrieval_attempts
            .get(media_id)
            .copied()
            .unwrap_or(0)
    }

    /// How many times `partition` has been narrated.
    pub fn narration_count(&self, partition: &PartitionUri) -> usize {
        self.state()
            .partitions
            .get(partition)
            .map_or(0, |log| log.narrations)
    }

    pub fn chronicled_count(&self, partition: &PartitionUri) -> usize {
        self.state()
            .partitions
            .get(partition)
            .map_or(0, |log| log.chronicled)
    }

    /// A connection serving `partition`.
    pub fn connection(&self, partition: &PartitionUri) -> Arc<InMemoryAuthorityConnection> {
        self.state().log_mut(partition);
        Arc::new(InMemoryAuthorityConnection {
            partition: partition.clone(),
            authority_uri: self.authority_uri.clone(),
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl Authority for InMemoryAuthority {
    fn authority_uri(&self) -> &str {
        &self.authority_uri
    }

    async fn connect_partition(&self, partition: &PartitionUri) -> AuthorityResult<Arc<dyn AuthorityConnection>> {
        if partition.authority_uri() != self.authority_uri {
            return Err(AuthorityError::Connection {
                uri: partition.to_string(),
                reason: format!("not served by {}", self.authority_uri),
            });
        }
        Ok(self.connection(partition))
    }
}

impl std::fmt::Debug for InMemoryAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAuthority")
            .field("authority_uri", &self.authority_uri)
            .finish_non_exhaustive()
    }
}

/// One partition's view of an [`InMemoryAuthority`].
pub struct InMemoryAuthorityConnection {
    partition: PartitionUri,
    authority_uri: String,
    state: Arc<Mutex<AuthorityState>>,
}

impl InMemoryAuthorityConnection {
    fn state(&self) -> std::sync::MutexGuard<'_, AuthorityState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl PartitionBackend for InMemoryAuthorityConnection {
    fn partition_uri(&self) -> &PartitionUri {
        &self.partition
    }

    async fn narrate(&self, opts: &NarrateOptions) -> AuthorityResult<Narration> {
        let truths: Vec<(EventId, Event)> = {
            let mut state = self.state();
            let log = state.log_mut(&self.partition);
            log.narrations += 1;
            let first = opts.first_event_id.unwrap_or(0);
            let last = opts
                .last_event_id
                .unwrap_or(EventId::MAX)
                .min(log.next_event_id().saturating_sub(1));
            if log.truths.is_empty() || first > last {
                Vec::new()
            } else {
                (first..=last)
                    .filter_map(|eid| {
                        let truth = log.truths.get(usize::try_from(eid).ok()?)?;
                        Some((eid, truth.clone()))
                    })
                    .collect()
            }
        };
        if let Some(callback) = &opts.callback {
            for (_, truth) in &truths {
                callback(truth);
            }
        }
        debug!(partition = %self.partition, count = truths.len(), "in-memory authority narration");
        Ok(Narration {
            truths,
            commands: Vec::new(),
        })
    }

    async fn read_media_content(&self, media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<Bytes>> {
        self.state().retrieve(media_id, info)
    }

    async fn get_media_url(&self, _media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<String>> {
        let Some(blob_id) = info.blob_id else {
            return Ok(None);
        };
        if !self.state().blobs.contains_key(&blob_id) {
            return Ok(None);
        }
        Ok(Some(format!("{}/blobs/{}", self.authority_uri, blob_id.to_hex())))
    }

    async fn prepare_blob(&self, content: Bytes) -> AuthorityResult<BlobId> {
        let blob_id = BlobId::for_content(&content);
        self.state().blobs.insert(blob_id, content);
        Ok(blob_id)
    }
}

#[async_trait]
impl AuthorityConnection for InMemoryAuthorityConnection {
    async fn chronicle(&self, command: &Event) -> AuthorityResult<Event> {
        let mut state = self.state();
        let log = state.log_mut(&self.partition);
        if log.truths.last().is_some_and(Event::is_frozen) {
            return Err(AuthorityError::Rejected {
                command_id: command.command_id.to_string(),
                reason: "partition is frozen".into(),
            });
        }
        log.chronicled += 1;
        let truth = state.append_truth(&self.partition, command);
        debug!(
            partition = %self.partition,
            command_id = %truth.command_id,
            event_id = ?truth.event_id_for(&self.partition),
            "chronicled command"
        );
        Ok(truth)
    }

    fn subscribe_truths(&self) -> broadcast::Receiver<Event> {
        self.state().log_mut(&self.partition).sender.subscribe()
    }

    fn content_retriever(&self) -> Arc<dyn ContentRetriever> {
        Arc::new(InMemoryRetriever {
            state: Arc::clone(&self.state),
        })
    }
}

struct InMemoryRetriever {
    state: Arc<Mutex<AuthorityState>>,
}

#[async_trait]
impl ContentRetriever for InMemoryRetriever {
    async fn retrieve(&self, media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<Bytes>> {
        self.state.lock().expect("lock poisoned").retrieve(media_id, info)
    }
}

/// Scheme module handing out one [`InMemoryAuthority`] per authority URI.
#[derive(Default)]
pub struct InMemorySchemeModule {
    authorities: Mutex<HashMap<String, Arc<InMemoryAuthority>>>,
}

impl InMemorySchemeModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The authority for `authority_uri`, created on first use.
    pub fn authority(&self, authority_uri: &str) -> Arc<InMemoryAuthority> {
        let mut authorities = self.authorities.lock().expect("lock poisoned");
        Arc::clone(
            authorities
                .entry(authority_uri.to_string())
                .or_insert_with(|| Arc::new(InMemoryAuthority::new(authority_uri))),
        )
    }
}

impl SchemeModule for InMemorySchemeModule {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    fn create_authority(&self, authority_uri: &str, _config: &AuthorityConfig) -> AuthorityResult<Arc<dyn Authority>> {
        Ok(self.authority(authority_uri))
    }
}
