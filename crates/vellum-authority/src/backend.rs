use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;
use vellum_types::{BlobId, Event, EventId, MediaId, MediaInfo, PartitionUri};

use crate::error::AuthorityResult;
use crate::retriever::ContentRetriever;

/// Applies a narrated event to external state and returns the resulting
/// state fragment. Must be idempotent under replay.
pub type EventCallback = Arc<dyn Fn(&Event) -> Value + Send + Sync>;

/// Options for narrating a partition's history.
#[derive(Clone)]
pub struct NarrateOptions {
    /// Explicit events to narrate first, in event id order.
    pub event_log: Option<Vec<Event>>,
    /// Retriever for the content of narrated media.
    pub retrieve_media_content: Option<Arc<dyn ContentRetriever>>,
    /// Receives every narrated truth.
    pub callback: Option<EventCallback>,
    pub first_event_id: Option<EventId>,
    /// Inclusive upper bound of the narrated range.
    pub last_event_id: Option<EventId>,
    /// Receives queued commands. Commands are narrated only when set.
    pub command_callback: Option<EventCallback>,
    /// Fail the narration when the latest content of a media cannot be
    /// retrieved.
    pub require_latest_media_contents: bool,
    pub dont_remote_narrate: bool,
}

impl Default for NarrateOptions {
    fn default() -> Self {
        Self {
            event_log: None,
            retrieve_media_content: None,
            callback: None,
            first_event_id: None,
            last_event_id: None,
            command_callback: None,
            require_latest_media_contents: true,
            dont_remote_narrate: false,
        }
    }
}

impl NarrateOptions {
    pub fn with_callback(mut self, callback: impl Fn(&Event) -> Value + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_command_callback(
        mut self,
        callback: impl Fn(&Event) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.command_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_event_log(mut self, events: Vec<Event>) -> Self {
        self.event_log = Some(events);
        self
    }

    pub fn with_range(mut self, first: Option<EventId>, last: Option<EventId>) -> Self {
        self.first_event_id = first;
        self.last_event_id = last;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContentRetriever>) -> Self {
        self.retrieve_media_content = Some(retriever);
        self
    }
}

impl fmt::Debug for NarrateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NarrateOptions")
            .field("event_log", &self.event_log.as_ref().map(Vec::len))
            .field("retrieve_media_content", &self.retrieve_media_content.is_some())
            .field("callback", &self.callback.is_some())
            .field("first_event_id", &self.first_event_id)
            .field("last_event_id", &self.last_event_id)
            .field("command_callback", &self.command_callback.is_some())
            .field("require_latest_media_contents", &self.require_latest_media_contents)
            .field("dont_remote_narrate", &self.dont_remote_narrate)
            .finish()
    }
}

/// What a narration delivered, keyed by the partition's event ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Narration {
    pub truths: Vec<(EventId, Event)>,
    pub commands: Vec<(EventId, Event)>,
}

impl Narration {
    pub fn len(&self) -> usize {
        self.truths.len() + self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.truths.is_empty() && self.commands.is_empty()
    }

    /// Highest event id among narrated truths and commands.
    pub fn last_event_id(&self) -> Option<EventId> {
        let truth = self.truths.last().map(|(id, _)| *id);
        let command = self.commands.last().map(|(id, _)| *id);
        truth.max(command)
    }

    pub fn extend(&mut self, other: Narration) {
        self.truths.extend(other.truths);
        self.commands.extend(other.commands);
    }
}

/// Read side shared by everything that can serve a partition.
#[async_trait]
pub trait PartitionBackend: Send + Sync {
    fn partition_uri(&self) -> &PartitionUri;

    /// Narrate authorized history in the requested range.
    async fn narrate(&self, opts: &NarrateOptions) -> AuthorityResult<Narration>;

    async fn read_media_content(&self, media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<Bytes>>;

    async fn get_media_url(&self, media_id: &MediaId, info: &MediaInfo) -> AuthorityResult<Option<String>>;

    /// Store `content` upstream and return its blob id.
    async fn prepare_blob(&self, content: Bytes) -> AuthorityResult<BlobId>;
}

/// A connection to the remote authority of one partition.
#[async_trait]
pub trait AuthorityConnection: PartitionBackend {
    /// Submit a claimed command. Returns the truth the authority recorded.
    async fn chronicle(&self, command: &Event) -> AuthorityResult<Event>;

    /// Truths authorized from now on, in event id order.
    fn subscribe_truths(&self) -> broadcast::Receiver<Event>;

    /// Retriever for media content stored by this authority.
    fn content_retriever(&self) -> Arc<dyn ContentRetriever>;
}
