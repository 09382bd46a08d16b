use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};
use vellum_authority::{ContentRetriever, DecodeContext, DecoderArray, NarrateOptions, Narration};
use vellum_store::{LogTable, MediaRow, StorageBatch};
use vellum_types::{
    BlobId, CommandQueueInfo, Event, EventId, EventLogInfo, MediaEntry, MediaId, MediaInfo, MediaType,
    MediaUpdate, MediaUpdateKind, PartitionUri,
};

use crate::error::{ScribeError, ScribeResult};
use crate::finalizer::{run_with_retries, FinalizerConfig, Finalizers, MediaFinalizer};
use crate::retrieval::RetrievalTracker;
use crate::scribe::Scribe;

/// URI scheme of media content served from the local blob store.
pub const LOCAL_BLOB_URL_SCHEME: &str = "vellum-blob";

/// Source of media infos for media the partition has never seen, such as
/// media inherited from a prototype in another partition.
pub trait MediaInheritance: Send + Sync {
    fn resolve_inherited_media_info(&self, media_id: &MediaId) -> Option<MediaInfo>;
}

/// Per-partition options of a [`ScribePartitionConnection`].
#[derive(Clone, Default)]
pub struct PartitionOptions {
    pub inheritance: Option<Arc<dyn MediaInheritance>>,
    /// The partition authorizes its own commands; recording a truth
    /// pre-authorizes the next queued command.
    pub self_authoritative: bool,
}

impl std::fmt::Debug for PartitionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionOptions")
            .field("inheritance", &self.inheritance.is_some())
            .field("self_authoritative", &self.self_authoritative)
            .finish()
    }
}

/// Outcome of [`ScribePartitionConnection::record_truth`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TruthRecord {
    /// `false` when the truth was already recorded.
    pub recorded: bool,
    /// Queued commands dropped because the truth conflicted with them.
    pub purged_commands: Vec<Event>,
}

/// A command positioned at the tail of the queue, with its media
/// finalizers. Call [`ClaimedCommand::finalize_local`] to make it durable.
pub struct ClaimedCommand {
    pub event_id: EventId,
    pub event: Event,
    connection: Arc<ScribePartitionConnection>,
    finalizers: Finalizers,
}

impl ClaimedCommand {
    pub fn finalizers(&self) -> &Finalizers {
        &self.finalizers
    }

    /// Write the command row (unless commands are transient) and fetch the
    /// command's media content, with a single retry.
    pub async fn finalize_local(&self) -> ScribeResult<()> {
        self.connection.write_command(self.event_id, &self.event).await?;
        run_with_retries(&FinalizerConfig::single_retry(), "command finalizer", || {
            self.connection.run_finalizers(&self.finalizers)
        })
        .await
    }
}

impl std::fmt::Debug for ClaimedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedCommand")
            .field("event_id", &self.event_id)
            .field("command_id", &self.event.command_id)
            .field("finalizers", &self.finalizers)
            .finish()
    }
}

#[derive(Clone)]
struct LogState {
    event_log: EventLogInfo,
    command_queue: CommandQueueInfo,
    frozen: bool,
    /// Copies of the queued commands, keyed by event id. The only copy when
    /// commands are transient.
    queued: BTreeMap<EventId, Event>,
}

impl LogState {
    fn dump(&self) -> String {
        format!(
            "event log: first={} last={:?}\ncommand queue: first={} ids={:?}\nfrozen: {}",
            self.event_log.first_event_id,
            self.event_log.last_event_id,
            self.command_queue.first_event_id,
            self.command_queue.command_ids,
            self.frozen,
        )
    }
}

/// Local log of one partition: authorized event log, speculative command
/// queue and media cache, all backed by the scribe's shared storage.
///
/// Log mutations are serialized through one async lock, so every
/// [`StorageBatch`] commits against the state it was built from.
pub struct ScribePartitionConnection {
    scribe: Arc<Scribe>,
    partition: PartitionUri,
    options: PartitionOptions,
    state: tokio::sync::Mutex<LogState>,
    /// Media as seen by readers, queued commands included.
    medias: Mutex<HashMap<MediaId, MediaEntry>>,
    /// Media as of the recorded truths. Only these entries hold blob
    /// references and media rows.
    authorized: Mutex<HashMap<MediaId, MediaEntry>>,
    tracker: RetrievalTracker,
}

impl ScribePartitionConnection {
    /// Load the log bounds, the command ids and the media entries of
    /// `partition` from storage.
    pub(crate) async fn connect(
        scribe: Arc<Scribe>,
        partition: PartitionUri,
        options: PartitionOptions,
    ) -> ScribeResult<Arc<Self>> {
        let storage = Arc::clone(scribe.storage());

        let event_log = match storage
            .log_bounds(&partition, LogTable::Events)
            .await
            .map_err(ScribeError::storage("read event bounds"))?
        {
            Some((first, last)) => EventLogInfo {
                first_event_id: first,
                last_event_id: Some(last),
            },
            None => EventLogInfo::starting_at(0),
        };

        let mut frozen = false;
        if let Some(last) = event_log.last_event_id {
            frozen = storage
                .read_log_entry(&partition, LogTable::Events, last)
                .await
                .map_err(ScribeError::storage("read last truth"))?
                .is_some_and(|truth| truth.is_frozen());
        }

        let mut queued = BTreeMap::new();
        let command_queue = match storage
            .log_bounds(&partition, LogTable::Commands)
            .await
            .map_err(ScribeError::storage("read command bounds"))?
        {
            Some((first, last)) => {
                let rows = storage
                    .read_log(&partition, LogTable::Commands, first, last)
                    .await
                    .map_err(ScribeError::storage("read commands"))?;
                if rows.len() as u64 != last - first + 1 {
                    return Err(ScribeError::integrity(
                        &partition,
                        format!(
                            "command queue {first}..={last} has {} rows; expected a contiguous range",
                            rows.len()
                        ),
                    ));
                }
                let command_ids = rows.iter().map(|(_, command)| command.command_id.clone()).collect();
                queued.extend(rows);
                CommandQueueInfo {
                    first_event_id: first,
                    command_ids,
                }
            }
            None => CommandQueueInfo::starting_at(event_log.next_event_id()),
        };

        let mut medias = HashMap::new();
        for row in storage
            .read_medias(&partition)
            .await
            .map_err(ScribeError::storage("read medias"))?
        {
            if let Some(blob_id) = row.media_info.blob_id {
                scribe.blobs().add_in_memory_ref(&blob_id).await?;
            }
            medias.insert(
                row.media_id.clone(),
                MediaEntry {
                    media_id: row.media_id,
                    media_info: row.media_info,
                    is_persisted: true,
                    is_in_memory: true,
                    native_content: None,
                },
            );
        }

        info!(
            %partition,
            truths = event_log.len(),
            commands = command_queue.len(),
            medias = medias.len(),
            frozen,
            "partition log connected"
        );
        scribe.report_command_count(&partition, command_queue.len());

        let tracker = RetrievalTracker::new(scribe.config().retrieval.clone());
        Ok(Arc::new(Self {
            scribe,
            partition,
            options,
            state: tokio::sync::Mutex::new(LogState {
                event_log,
                command_queue,
                frozen,
                queued,
            }),
            authorized: Mutex::new(medias.clone()),
            medias: Mutex::new(medias),
            tracker,
        }))
    }

    pub fn partition_uri(&self) -> &PartitionUri {
        &self.partition
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    pub fn tracker(&self) -> &RetrievalTracker {
        &self.tracker
    }

    pub async fn event_log_info(&self) -> EventLogInfo {
        self.state.lock().await.event_log
    }

    pub async fn command_queue_info(&self) -> CommandQueueInfo {
        self.state.lock().await.command_queue.clone()
    }

    pub async fn is_frozen(&self) -> bool {
        self.state.lock().await.frozen
    }

    fn is_transient(&self) -> bool {
        self.scribe.config().transient
    }

    /// Read truths, and queued commands when a command callback is set,
    /// from the local log.
    ///
    /// Truths cover `first_event_id ..= last_event_id` clamped to the
    /// authorized log. Commands follow the last truth. A read of the whole
    /// queue refreshes the cached command ids.
    pub async fn narrate(&self, opts: &NarrateOptions) -> ScribeResult<Narration> {
        let state = self.state.lock().await.clone();
        let first = opts.first_event_id.unwrap_or(state.event_log.first_event_id);
        let mut narration = Narration::default();

        if let Some(last_truth) = state.event_log.last_event_id {
            let last = opts.last_event_id.map_or(last_truth, |l| l.min(last_truth));
            if first <= last {
                let truths = self
                    .scribe
                    .storage()
                    .read_log(&self.partition, LogTable::Events, first, last)
                    .await
                    .map_err(ScribeError::storage("narrate truths"))?;
                if let Some(callback) = &opts.callback {
                    for (_, truth) in &truths {
                        callback(truth);
                    }
                }
                narration.truths = truths;
            }
        }

        if let (Some(callback), Some(queue_last)) = (&opts.command_callback, state.command_queue.last_event_id()) {
            let from = first
                .max(state.command_queue.first_event_id)
                .max(state.event_log.next_event_id());
            let to = opts.last_event_id.map_or(queue_last, |l| l.min(queue_last));
            if from <= to {
                let commands = self.queued_commands(&state, from, to).await?;
                for (_, command) in &commands {
                    callback(command);
                }
                let whole_queue = from == state.command_queue.first_event_id
                    && to == queue_last
                    && commands.len() == state.command_queue.len();
                if whole_queue {
                    self.refresh_command_ids(&state.command_queue, &commands).await;
                }
                narration.commands = commands;
            }
        }

        debug!(
            partition = %self.partition,
            truths = narration.truths.len(),
            commands = narration.commands.len(),
            "local narration"
        );
        Ok(narration)
    }

    async fn refresh_command_ids(&self, read_against: &CommandQueueInfo, commands: &[(EventId, Event)]) {
        let mut state = self.state.lock().await;
        if state.command_queue != *read_against {
            return;
        }
        state.command_queue.command_ids = commands.iter().map(|(_, c)| c.command_id.clone()).collect();
        if commands.last().is_some_and(|(_, c)| c.is_frozen()) {
            state.frozen = true;
        }
    }

    /// Commands in `first..=last`, from storage rows falling back to the
    /// in-memory copies of rows not written yet.
    async fn queued_commands(&self, state: &LogState, first: EventId, last: EventId) -> ScribeResult<Vec<(EventId, Event)>> {
        let mut commands: BTreeMap<EventId, Event> = if self.is_transient() {
            BTreeMap::new()
        } else {
            self.scribe
                .storage()
                .read_log(&self.partition, LogTable::Commands, first, last)
                .await
                .map_err(ScribeError::storage("read commands"))?
                .into_iter()
                .collect()
        };
        for (event_id, command) in state.queued.range(first..=last) {
            commands.entry(*event_id).or_insert_with(|| command.clone());
        }
        Ok(commands.into_iter().collect())
    }

    /// Position `command` at the tail of the queue and reprocess its media.
    ///
    /// Fails on a frozen partition. The returned command is not durable
    /// until [`ClaimedCommand::finalize_local`] runs.
    pub async fn claim(
        self: &Arc<Self>,
        mut command: Event,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> ScribeResult<ClaimedCommand> {
        let mut state = self.state.lock().await;
        if state.frozen {
            return Err(ScribeError::PartitionFrozen(self.partition.to_string()));
        }

        let floor = state.event_log.next_event_id();
        if state.command_queue.first_event_id < floor {
            self.drop_superseded_commands(&mut state, floor).await?;
        }

        let event_id = state.command_queue.next_event_id();
        command.set_event_id(&self.partition, event_id);
        let finalizers = self.reprocess_command(&command, event_id, retriever)?;
        state.command_queue.command_ids.push(command.command_id.clone());
        state.queued.insert(event_id, command.clone());
        let count = state.command_queue.len();
        drop(state);

        self.scribe.report_command_count(&self.partition, count);
        debug!(partition = %self.partition, event_id, command_id = %command.command_id, "command claimed");
        Ok(ClaimedCommand {
            event_id,
            event: command,
            connection: Arc::clone(self),
            finalizers,
        })
    }

    /// Move the queue floor up to `floor`, deleting the rows below it.
    async fn drop_superseded_commands(&self, state: &mut LogState, floor: EventId) -> ScribeResult<()> {
        let stale_first = state.command_queue.first_event_id;
        if !state.command_queue.is_empty() && !self.is_transient() {
            let mut batch = StorageBatch::new();
            batch.delete_log_range(&self.partition, LogTable::Commands, stale_first, floor - 1);
            self.scribe
                .storage()
                .commit(batch)
                .await
                .map_err(ScribeError::storage("delete superseded commands"))?;
        }
        state.command_queue.advance_to(floor);
        state.queued = state.queued.split_off(&floor);
        debug!(partition = %self.partition, stale_first, floor, "superseded commands dropped");
        Ok(())
    }

    /// Write the command row, unless the command was purged or recorded in
    /// the meantime.
    async fn write_command(&self, event_id: EventId, command: &Event) -> ScribeResult<()> {
        if self.is_transient() {
            return Ok(());
        }
        let state = self.state.lock().await;
        if state.command_queue.command_id_at(event_id) != Some(&command.command_id) {
            debug!(partition = %self.partition, event_id, "command left the queue before its row was written");
            return Ok(());
        }
        let mut batch = StorageBatch::new();
        batch.put_log_entry(&self.partition, LogTable::Commands, event_id, command.clone());
        self.scribe
            .storage()
            .commit(batch)
            .await
            .map_err(ScribeError::storage("write command"))
    }

    /// Record the authorized `truth` at the end of the event log.
    ///
    /// A truth below the next event id is ignored; one above it is a
    /// protocol violation. A truth confirming the queue head removes that
    /// command. A truth conflicting with it purges the whole queue. The event
    /// row and the command deletions commit as one batch.
    ///
    /// On a self-authoritative partition `pre_authorize` receives the next
    /// queued command after the commit.
    pub async fn record_truth(
        &self,
        truth: &Event,
        pre_authorize: Option<&(dyn Fn(Event) + Send + Sync)>,
    ) -> ScribeResult<TruthRecord> {
        let event_id = truth
            .event_id_for(&self.partition)
            .ok_or_else(|| ScribeError::MissingEventId {
                partition: self.partition.to_string(),
                command_id: truth.command_id.to_string(),
            })?;

        let mut state = self.state.lock().await;
        let expected = state.event_log.next_event_id();
        if event_id < expected {
            debug!(partition = %self.partition, event_id, expected, "stale truth ignored");
            return Ok(TruthRecord::default());
        }
        if event_id > expected {
            return Err(ScribeError::ProtocolViolation {
                partition: self.partition.to_string(),
                expected,
                actual: event_id,
            });
        }

        let transient = self.is_transient();
        let mut next = state.clone();
        let mut batch = StorageBatch::new();
        batch.put_log_entry(&self.partition, LogTable::Events, event_id, truth.clone());

        if next.command_queue.first_event_id < event_id {
            if !next.command_queue.is_empty() && !transient {
                batch.delete_log_range(
                    &self.partition,
                    LogTable::Commands,
                    next.command_queue.first_event_id,
                    event_id - 1,
                );
            }
            next.command_queue.advance_to(event_id);
        }

        let mut purged_commands = Vec::new();
        let mut touched_medias = HashSet::new();
        match next.command_queue.command_id_at(event_id).cloned() {
            Some(head) if head == truth.command_id => {
                if !transient {
                    let row = self
                        .scribe
                        .storage()
                        .read_log_entry(&self.partition, LogTable::Commands, event_id)
                        .await
                        .map_err(ScribeError::storage("read confirmed command"))?;
                    if let Some(row) = row {
                        if row.command_id != head {
                            return Err(ScribeError::StorageIntegrity {
                                partition: self.partition.to_string(),
                                reason: format!(
                                    "command row {event_id} holds {} but the queue expects {head}",
                                    row.command_id
                                ),
                                state: state.dump(),
                            });
                        }
                    }
                    batch.delete_log_range(&self.partition, LogTable::Commands, event_id, event_id);
                }
                next.command_queue.advance_to(event_id + 1);
            }
            Some(head) => {
                let queue_first = next.command_queue.first_event_id;
                let queue_last = next.command_queue.last_event_id().unwrap_or(queue_first);
                purged_commands = self
                    .queued_commands(&next, queue_first, queue_last)
                    .await?
                    .into_iter()
                    .map(|(_, command)| command)
                    .collect();
                for command in &purged_commands {
                    let updates = command.action.media_updates()?;
                    touched_medias.extend(updates.into_iter().map(|update| update.media_id));
                }
                if !transient {
                    batch.delete_log_range(&self.partition, LogTable::Commands, queue_first, queue_last);
                }
                next.command_queue.reset_to(event_id + 1);
                warn!(
                    partition = %self.partition,
                    event_id,
                    expected_command = %head,
                    truth_command = %truth.command_id,
                    purged = purged_commands.len(),
                    "truth conflicts with queued command; queue purged"
                );
            }
            None => next.command_queue.advance_to(event_id + 1),
        }

        next.event_log.last_event_id = Some(event_id);
        next.frozen = state.frozen || (truth.is_frozen() && next.command_queue.is_empty());
        next.queued = next.queued.split_off(&next.command_queue.first_event_id);
        if next.command_queue.is_empty() {
            next.queued.clear();
        }

        self.scribe
            .storage()
            .commit(batch)
            .await
            .map_err(ScribeError::storage("record truth"))?;
        *state = next;
        if !touched_medias.is_empty() {
            self.restore_authorized_medias(&touched_medias);
        }

        let next_command = match pre_authorize {
            Some(_) if self.options.self_authoritative => state.queued.get(&(event_id + 1)).cloned(),
            _ => None,
        };
        let count = state.command_queue.len();
        drop(state);

        self.scribe.report_command_count(&self.partition, count);
        debug!(partition = %self.partition, event_id, command_id = %truth.command_id, "truth recorded");
        if let (Some(pre_authorize), Some(command)) = (pre_authorize, next_command) {
            pre_authorize(command);
        }
        Ok(TruthRecord {
            recorded: true,
            purged_commands,
        })
    }

    /// Finalizers for a truth about to be recorded at `event_id`.
    ///
    /// Content is fetched only for events newer than both the last recorded
    /// truth and the last queued command; older ones were handled when they
    /// were first seen.
    pub async fn create_finalizers(
        &self,
        event: &Event,
        event_id: EventId,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> ScribeResult<Finalizers> {
        let state = self.state.lock().await;
        let fetch = state.event_log.last_event_id.map_or(true, |last| event_id > last)
            && state.command_queue.last_event_id().map_or(true, |last| event_id > last);
        self.reprocess_truth(event, event_id, retriever.filter(|_| fetch), &state.queued)
    }

    /// Run every media finalizer of `finalizers` once, in order.
    pub async fn run_finalizers(&self, finalizers: &Finalizers) -> ScribeResult<()> {
        for finalizer in &finalizers.media {
            self.run_media_finalizer(finalizer).await?;
        }
        Ok(())
    }

    /// Overlay the media sub-actions of a queued command onto the media
    /// cache. The finalizers only fetch content.
    fn reprocess_command(
        &self,
        command: &Event,
        event_id: EventId,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> ScribeResult<Finalizers> {
        let updates = command.action.media_updates()?;
        let mut finalizers = Finalizers {
            event_id,
            media: Vec::with_capacity(updates.len()),
        };
        let mut medias = self.medias.lock().expect("lock poisoned");
        for update in updates {
            let mut entry = self.overlay(medias.get(&update.media_id).cloned(), &update)?;
            entry.is_in_memory = false;
            medias.insert(update.media_id.clone(), entry.clone());
            finalizers.media.push(MediaFinalizer::fetch_only(entry, retriever.clone()));
        }
        Ok(finalizers)
    }

    /// Overlay the media sub-actions of a truth onto the authorized media and
    /// build one finalizer per sub-action. The media cache follows unless a
    /// command queued after `event_id` touches the same media.
    fn reprocess_truth(
        &self,
        truth: &Event,
        event_id: EventId,
        retriever: Option<Arc<dyn ContentRetriever>>,
        queued: &BTreeMap<EventId, Event>,
    ) -> ScribeResult<Finalizers> {
        let updates = truth.action.media_updates()?;
        let mut finalizers = Finalizers {
            event_id,
            media: Vec::with_capacity(updates.len()),
        };
        if updates.is_empty() {
            return Ok(finalizers);
        }
        let mut speculated = HashSet::new();
        for (_, command) in queued.range(event_id.saturating_add(1)..) {
            let updates = command.action.media_updates()?;
            speculated.extend(updates.into_iter().map(|update| update.media_id));
        }

        let mut authorized = self.authorized.lock().expect("lock poisoned");
        let mut medias = self.medias.lock().expect("lock poisoned");
        for update in updates {
            let previous = authorized.get(&update.media_id).cloned();
            let previous_blob = previous.as_ref().and_then(MediaEntry::blob_id);
            let entry = self.overlay(previous, &update)?;
            authorized.insert(update.media_id.clone(), entry.clone());
            if !speculated.contains(&update.media_id) {
                medias.insert(update.media_id.clone(), entry.clone());
            }
            finalizers
                .media
                .push(MediaFinalizer::new(entry, previous_blob, retriever.clone()));
        }
        Ok(finalizers)
    }

    /// Apply one media update to `base`, or to an inherited or empty entry
    /// when the media is new here.
    fn overlay(&self, base: Option<MediaEntry>, update: &MediaUpdate) -> ScribeResult<MediaEntry> {
        let mut entry = match (base, update.kind) {
            (Some(entry), _) => entry,
            (None, MediaUpdateKind::Created) => MediaEntry::empty(update.media_id.clone()),
            (None, MediaUpdateKind::Modified) => {
                let inherited = self
                    .options
                    .inheritance
                    .as_ref()
                    .and_then(|inheritance| inheritance.resolve_inherited_media_info(&update.media_id))
                    .ok_or_else(|| {
                        ScribeError::integrity(
                            &self.partition,
                            format!("modification of unknown media {}", update.media_id),
                        )
                    })?;
                let mut entry = MediaEntry::empty(update.media_id.clone());
                entry.media_info = inherited;
                entry
            }
        };
        let previous_blob = entry.blob_id();
        entry.media_info.overlay(&update.info);
        if entry.blob_id() != previous_blob {
            entry.native_content = None;
        }
        entry.is_persisted = false;
        entry.is_in_memory = true;
        Ok(entry)
    }

    /// Reset cache entries of media touched by purged commands to their
    /// authorized state. Media known only to those commands are dropped.
    fn restore_authorized_medias(&self, media_ids: &HashSet<MediaId>) {
        let authorized = self.authorized.lock().expect("lock poisoned");
        let mut medias = self.medias.lock().expect("lock poisoned");
        for media_id in media_ids {
            match authorized.get(media_id) {
                Some(entry) => medias.insert(media_id.clone(), entry.clone()),
                None => medias.remove(media_id),
            };
        }
        debug!(partition = %self.partition, medias = media_ids.len(), "purged media restored");
    }

    async fn run_media_finalizer(&self, finalizer: &MediaFinalizer) -> ScribeResult<()> {
        let blobs = self.scribe.blobs();
        let entry = &finalizer.entry;
        let new_blob = entry.blob_id();

        if let (Some(blob_id), Some(retriever)) = (new_blob, &finalizer.retriever) {
            if !blobs.has_content(&blob_id).await? {
                if let Some(content) = self
                    .tracker
                    .retrieve(&entry.media_id, &entry.media_info, retriever.as_ref())
                    .await
                {
                    blobs.persist(content, blob_id, 0).await?;
                }
            }
        }
        if finalizer.fetch_only {
            return Ok(());
        }

        if !finalizer.refs_moved() {
            if new_blob != finalizer.previous_blob {
                if let Some(blob_id) = &new_blob {
                    blobs.add_persist_ref(blob_id).await?;
                    blobs.add_in_memory_ref(blob_id).await?;
                }
                if let Some(blob_id) = &finalizer.previous_blob {
                    blobs.remove_persist_ref(blob_id).await?;
                    blobs.remove_in_memory_ref(blob_id).await?;
                }
            }
            finalizer.mark_refs_moved();
        }

        if !finalizer.row_written() {
            let mut batch = StorageBatch::new();
            batch.put_media(
                &self.partition,
                MediaRow {
                    media_id: entry.media_id.clone(),
                    media_info: entry.media_info.clone(),
                },
            );
            self.scribe
                .storage()
                .commit(batch)
                .await
                .map_err(ScribeError::storage("write media"))?;
            finalizer.mark_row_written();
        }

        for map in [&self.authorized, &self.medias] {
            let mut medias = map.lock().expect("lock poisoned");
            if let Some(cached) = medias.get_mut(&entry.media_id) {
                if cached.media_info == entry.media_info {
                    cached.is_persisted = true;
                }
            }
        }
        Ok(())
    }

    /// Retrieve and store the content of every authorized media whose blob
    /// is missing locally.
    pub async fn ensure_media_contents(&self, retriever: Arc<dyn ContentRetriever>) -> ScribeResult<usize> {
        let entries: Vec<MediaEntry> = self.authorized.lock().expect("lock poisoned").values().cloned().collect();
        let mut fetched = 0;
        for entry in entries {
            let Some(blob_id) = entry.blob_id() else {
                continue;
            };
            if self.scribe.blobs().has_content(&blob_id).await? {
                continue;
            }
            if let Some(content) = self
                .tracker
                .retrieve(&entry.media_id, &entry.media_info, retriever.as_ref())
                .await
            {
                self.scribe.blobs().persist(content, blob_id, 1).await?;
                fetched += 1;
            }
        }
        Ok(fetched)
    }

    pub fn media_entry(&self, media_id: &MediaId) -> Option<MediaEntry> {
        self.medias.lock().expect("lock poisoned").get(media_id).cloned()
    }

    /// Info of a cached or inherited media.
    pub fn media_info(&self, media_id: &MediaId) -> Option<MediaInfo> {
        self.media_entry(media_id).map(|entry| entry.media_info).or_else(|| {
            self.options
                .inheritance
                .as_ref()
                .and_then(|inheritance| inheritance.resolve_inherited_media_info(media_id))
        })
    }

    /// Local content of a media, `None` when its blob is not stored here.
    pub async fn read_media_content(&self, media_id: &MediaId) -> ScribeResult<Option<Bytes>> {
        let info = self
            .media_info(media_id)
            .ok_or_else(|| ScribeError::UnknownMedia(media_id.to_string()))?;
        match info.blob_id {
            Some(blob_id) => self.scribe.blobs().read(&blob_id).await,
            None => Ok(None),
        }
    }

    /// Decode the local content of a media with the decoder registered for
    /// its media type. Falls back to the scribe's decoders.
    pub async fn decode_media_content(
        &self,
        media_id: &MediaId,
        decoders: Option<&DecoderArray>,
    ) -> ScribeResult<Option<Value>> {
        let info = self
            .media_info(media_id)
            .ok_or_else(|| ScribeError::UnknownMedia(media_id.to_string()))?;
        let Some(blob_id) = info.blob_id else {
            return Ok(None);
        };
        let media_type = info.media_type.clone().unwrap_or_else(|| MediaType::new("", ""));
        let decoder = decoders
            .unwrap_or_else(|| self.scribe.decoders().as_ref())
            .find(&media_type);
        let Some(decoder) = decoder else {
            return Ok(None);
        };
        let ctx = DecodeContext {
            media_id: Some(media_id.clone()),
            name: info.name.clone(),
            media_type: info.media_type.clone(),
        };
        let value = self.scribe.blobs().decode(&blob_id, decoder.as_ref(), &ctx).await?;
        if let Some(value) = &value {
            let mut medias = self.medias.lock().expect("lock poisoned");
            if let Some(cached) = medias.get_mut(media_id) {
                if cached.blob_id() == Some(blob_id) {
                    cached.native_content = Some(value.clone());
                }
            }
        }
        Ok(value)
    }

    /// URL of a media's locally stored content.
    pub async fn get_media_url(&self, media_id: &MediaId) -> ScribeResult<Option<String>> {
        let info = self
            .media_info(media_id)
            .ok_or_else(|| ScribeError::UnknownMedia(media_id.to_string()))?;
        match info.blob_id {
            Some(blob_id) if self.scribe.blobs().has_content(&blob_id).await? => {
                Ok(Some(local_blob_url(&blob_id)))
            }
            _ => Ok(None),
        }
    }

    /// Store content ahead of the command that will reference it.
    pub async fn prepare_blob(&self, content: Bytes) -> ScribeResult<BlobId> {
        let row = self.scribe.blobs().persist_content(content, 0).await?;
        Ok(row.blob_id)
    }

    /// Release the in-memory blob references held by persisted media entries.
    pub async fn disconnect(&self) -> ScribeResult<()> {
        self.medias.lock().expect("lock poisoned").clear();
        let entries: Vec<MediaEntry> = self
            .authorized
            .lock()
            .expect("lock poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            if let (Some(blob_id), true) = (entry.blob_id(), entry.is_persisted) {
                self.scribe.blobs().remove_in_memory_ref(&blob_id).await?;
            }
        }
        self.scribe.report_command_count(&self.partition, 0);
        info!(partition = %self.partition, "partition log disconnected");
        Ok(())
    }
}

impl std::fmt::Debug for ScribePartitionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScribePartitionConnection")
            .field("partition", &self.partition)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// `vellum-blob:<hex>` URL of a locally stored blob.
pub fn local_blob_url(blob_id: &BlobId) -> String {
    format!("{LOCAL_BLOB_URL_SCHEME}:{}", blob_id.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scribe::ScribeConfig;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vellum_authority::{AuthorityConnection, InMemoryAuthority};
    use vellum_store::{InMemoryStorage, LocalStorage};
    use vellum_types::event::MEDIA_TYPE_NAME;
    use vellum_types::{Action, CommandId};

    fn partition() -> PartitionUri {
        PartitionUri::parse("vellum-local:///log").unwrap()
    }

    fn entity(id: &str) -> Action {
        Action::Created {
            id: id.into(),
            type_name: "Entity".into(),
            initial_state: Value::Null,
        }
    }

    fn truth(event_id: EventId, command_id: &str) -> Event {
        Event::for_partition(&partition(), event_id, CommandId::from_string(command_id), entity(command_id))
    }

    fn media_created(id: &str, blob_id: BlobId) -> Action {
        Action::Created {
            id: id.into(),
            type_name: MEDIA_TYPE_NAME.into(),
            initial_state: json!({ "content": blob_id, "mediaType": { "type": "text", "subtype": "plain" } }),
        }
    }

    fn media_modified(id: &str, blob_id: BlobId) -> Action {
        Action::Modified {
            id: id.into(),
            type_name: MEDIA_TYPE_NAME.into(),
            sets: json!({ "content": blob_id }),
        }
    }

    async fn open(storage: Arc<dyn LocalStorage>, config: ScribeConfig, options: PartitionOptions) -> Arc<ScribePartitionConnection> {
        Scribe::new(storage, config)
            .connect_partition(partition(), options)
            .await
            .unwrap()
    }

    async fn memory_log() -> Arc<ScribePartitionConnection> {
        open(Arc::new(InMemoryStorage::new()), ScribeConfig::default(), PartitionOptions::default()).await
    }

    async fn record_truths(log: &ScribePartitionConnection, count: u64) {
        for event_id in 0..count {
            let record = log.record_truth(&truth(event_id, &format!("t{event_id}")), None).await.unwrap();
            assert!(record.recorded);
        }
    }

    #[tokio::test]
    async fn narrates_recorded_truths_after_reconnect() {
        let storage: Arc<dyn LocalStorage> = Arc::new(InMemoryStorage::new());
        let log = open(Arc::clone(&storage), ScribeConfig::default(), PartitionOptions::default()).await;
        record_truths(&log, 5).await;

        let log = open(storage, ScribeConfig::default(), PartitionOptions::default()).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let opts = NarrateOptions::default().with_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Value::Null
        });
        let narration = log.narrate(&opts).await.unwrap();
        assert_eq!(narration.truths.len(), 5);
        assert!(narration.commands.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(log.event_log_info().await.next_event_id(), 5);
    }

    #[tokio::test]
    async fn narration_range_is_clamped() {
        let log = memory_log().await;
        record_truths(&log, 5).await;
        let opts = NarrateOptions::default().with_range(Some(2), Some(9));
        let narration = log.narrate(&opts).await.unwrap();
        let ids: Vec<EventId> = narration.truths.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    proptest! {
        #[test]
        fn only_the_next_event_id_is_accepted(proposals in proptest::collection::vec(0u64..12, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let log = memory_log().await;
                let mut next = 0;
                for (i, event_id) in proposals.into_iter().enumerate() {
                    let result = log.record_truth(&truth(event_id, &format!("c{i}")), None).await;
                    if event_id < next {
                        assert!(!result.unwrap().recorded);
                    } else if event_id == next {
                        assert!(result.unwrap().recorded);
                        next += 1;
                    } else {
                        assert!(matches!(result, Err(ScribeError::ProtocolViolation { expected, actual, .. })
                            if expected == next && actual == event_id));
                    }
                }
                assert_eq!(log.event_log_info().await.next_event_id(), next);
            });
        }
    }

    #[tokio::test]
    async fn matching_truth_confirms_queue_head() {
        let log = memory_log().await;
        record_truths(&log, 10).await;

        let first = log.claim(Event::command(entity("a")), None).await.unwrap();
        let second = log.claim(Event::command(entity("b")), None).await.unwrap();
        first.finalize_local().await.unwrap();
        second.finalize_local().await.unwrap();
        assert_eq!((first.event_id, second.event_id), (10, 11));

        let record = log.record_truth(&first.event, None).await.unwrap();
        assert!(record.recorded);
        assert!(record.purged_commands.is_empty());

        let queue = log.command_queue_info().await;
        assert_eq!(queue.first_event_id, 11);
        assert_eq!(queue.command_ids, vec![second.event.command_id.clone()]);
        assert_eq!(log.event_log_info().await.last_event_id, Some(10));
        let rows = log.scribe.storage().log_bounds(&partition(), LogTable::Commands).await.unwrap();
        assert_eq!(rows, Some((11, 11)));
    }

    #[tokio::test]
    async fn conflicting_truth_purges_the_queue() {
        let log = memory_log().await;
        record_truths(&log, 5).await;
        let c0 = log.claim(Event::command(entity("c0")), None).await.unwrap();
        let c1 = log.claim(Event::command(entity("c1")), None).await.unwrap();
        c0.finalize_local().await.unwrap();
        c1.finalize_local().await.unwrap();

        let record = log.record_truth(&truth(5, "foreign"), None).await.unwrap();
        assert!(record.recorded);
        let purged: Vec<&CommandId> = record.purged_commands.iter().map(|c| &c.command_id).collect();
        assert_eq!(purged, vec![&c0.event.command_id, &c1.event.command_id]);

        let queue = log.command_queue_info().await;
        assert!(queue.is_empty());
        assert_eq!(queue.first_event_id, 6);
        assert_eq!(log.scribe.storage().log_bounds(&partition(), LogTable::Commands).await.unwrap(), None);
        assert_eq!(log.scribe.command_count(), 0);
    }

    #[tokio::test]
    async fn command_row_mismatch_is_an_integrity_error() {
        let log = memory_log().await;
        let claimed = log.claim(Event::command(entity("a")), None).await.unwrap();
        claimed.finalize_local().await.unwrap();

        let mut batch = StorageBatch::new();
        batch.put_log_entry(&partition(), LogTable::Commands, 0, truth(0, "tampered"));
        log.scribe.storage().commit(batch).await.unwrap();

        let err = log.record_truth(&claimed.event, None).await.unwrap_err();
        match err {
            ScribeError::StorageIntegrity { state, .. } => assert!(state.contains("command queue")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn frozen_partition_rejects_claims() {
        let log = memory_log().await;
        let frozen = Event::for_partition(&partition(), 0, CommandId::new(), Action::Frozen { id: "root".into() });
        log.record_truth(&frozen, None).await.unwrap();
        assert!(log.is_frozen().await);
        let err = log.claim(Event::command(entity("late")), None).await.unwrap_err();
        assert!(matches!(err, ScribeError::PartitionFrozen(_)));
    }

    #[tokio::test]
    async fn claim_drops_commands_below_the_event_log() {
        let storage: Arc<dyn LocalStorage> = Arc::new(InMemoryStorage::new());
        let mut batch = StorageBatch::new();
        for event_id in 0..4 {
            batch.put_log_entry(&partition(), LogTable::Events, event_id, truth(event_id, &format!("t{event_id}")));
        }
        for event_id in 0..2 {
            batch.put_log_entry(&partition(), LogTable::Commands, event_id, truth(event_id, &format!("t{event_id}")));
        }
        storage.commit(batch).await.unwrap();

        let log = open(Arc::clone(&storage), ScribeConfig::default(), PartitionOptions::default()).await;
        assert_eq!(log.command_queue_info().await.len(), 2);
        let claimed = log.claim(Event::command(entity("new")), None).await.unwrap();
        claimed.finalize_local().await.unwrap();
        assert_eq!(claimed.event_id, 4);
        assert_eq!(log.command_queue_info().await.len(), 1);
        assert_eq!(storage.log_bounds(&partition(), LogTable::Commands).await.unwrap(), Some((4, 4)));
    }

    #[tokio::test]
    async fn transient_commands_are_not_written() {
        let config = ScribeConfig {
            transient: true,
            ..ScribeConfig::default()
        };
        let storage: Arc<dyn LocalStorage> = Arc::new(InMemoryStorage::new());
        let log = open(Arc::clone(&storage), config, PartitionOptions::default()).await;
        let claimed = log.claim(Event::command(entity("a")), None).await.unwrap();
        claimed.finalize_local().await.unwrap();
        assert_eq!(storage.log_bounds(&partition(), LogTable::Commands).await.unwrap(), None);

        let opts = NarrateOptions::default().with_command_callback(|_| Value::Null);
        let narration = log.narrate(&opts).await.unwrap();
        assert_eq!(narration.commands.len(), 1);

        let record = log.record_truth(&truth(0, "other"), None).await.unwrap();
        assert_eq!(record.purged_commands.len(), 1);
    }

    #[tokio::test]
    async fn recording_pre_authorizes_the_next_command() {
        let options = PartitionOptions {
            self_authoritative: true,
            ..PartitionOptions::default()
        };
        let log = open(Arc::new(InMemoryStorage::new()), ScribeConfig::default(), options).await;
        let first = log.claim(Event::command(entity("a")), None).await.unwrap();
        let second = log.claim(Event::command(entity("b")), None).await.unwrap();

        let authorized = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&authorized);
        let pre_authorize = move |command: Event| sink.lock().unwrap().push(command);
        log.record_truth(&first.event, Some(&pre_authorize)).await.unwrap();

        let authorized = authorized.lock().unwrap();
        assert_eq!(authorized.len(), 1);
        assert_eq!(authorized[0].command_id, second.event.command_id);
        assert_eq!(authorized[0].event_id_for(&partition()), Some(1));
    }

    async fn confirm(log: &ScribePartitionConnection, claimed: &ClaimedCommand) {
        let finalizers = log.create_finalizers(&claimed.event, claimed.event_id, None).await.unwrap();
        assert!(log.record_truth(&claimed.event, None).await.unwrap().recorded);
        log.run_finalizers(&finalizers).await.unwrap();
    }

    #[tokio::test]
    async fn media_finalizers_move_blob_references() {
        let authority = InMemoryAuthority::new("vellum-memory://host");
        let remote = authority.connection(&partition());
        let first_blob = authority.store_blob(Bytes::from_static(b"first"));
        let second_blob = authority.store_blob(Bytes::from_static(b"second"));
        let log = memory_log().await;
        let blobs = log.scribe.blobs();

        let created = log
            .claim(Event::command(media_created("m", first_blob)), Some(remote.content_retriever()))
            .await
            .unwrap();
        created.finalize_local().await.unwrap();
        assert_eq!(blobs.blob_info(&first_blob).await.unwrap().unwrap().persist_ref_count, 0);
        assert_eq!(
            log.read_media_content(&MediaId::new("m")).await.unwrap(),
            Some(Bytes::from_static(b"first"))
        );
        assert!(!log.media_entry(&MediaId::new("m")).unwrap().is_persisted);

        confirm(&log, &created).await;
        assert_eq!(blobs.blob_info(&first_blob).await.unwrap().unwrap().persist_ref_count, 1);
        assert!(log.media_entry(&MediaId::new("m")).unwrap().is_persisted);

        let modified = log
            .claim(Event::command(media_modified("m", second_blob)), Some(remote.content_retriever()))
            .await
            .unwrap();
        modified.finalize_local().await.unwrap();
        confirm(&log, &modified).await;
        assert_eq!(blobs.blob_info(&first_blob).await.unwrap().unwrap().persist_ref_count, 0);
        assert_eq!(blobs.blob_info(&second_blob).await.unwrap().unwrap().persist_ref_count, 1);
        assert_eq!(
            log.decode_media_content(&MediaId::new("m"), None).await.unwrap(),
            Some(json!("second"))
        );
        assert_eq!(
            log.get_media_url(&MediaId::new("m")).await.unwrap(),
            Some(local_blob_url(&second_blob))
        );
    }

    #[tokio::test]
    async fn purge_reverts_speculative_media() {
        let log = memory_log().await;
        let blob_id = log.prepare_blob(Bytes::from_static(b"speculative")).await.unwrap();
        let claimed = log.claim(Event::command(media_created("m", blob_id)), None).await.unwrap();
        claimed.finalize_local().await.unwrap();
        assert!(log.media_entry(&MediaId::new("m")).is_some());

        let record = log.record_truth(&truth(0, "foreign"), None).await.unwrap();
        assert_eq!(record.purged_commands.len(), 1);

        assert!(log.media_entry(&MediaId::new("m")).is_none());
        assert!(matches!(
            log.read_media_content(&MediaId::new("m")).await,
            Err(ScribeError::UnknownMedia(_))
        ));
        assert!(log.scribe.storage().read_medias(&partition()).await.unwrap().is_empty());
        let info = log.scribe.blobs().blob_info(&blob_id).await.unwrap().unwrap();
        assert_eq!((info.persist_ref_count, info.in_memory_ref_count), (0, 0));
    }

    #[tokio::test]
    async fn purge_restores_the_authorized_media() {
        let log = memory_log().await;
        let authorized_blob = log.prepare_blob(Bytes::from_static(b"authorized")).await.unwrap();
        let speculative_blob = log.prepare_blob(Bytes::from_static(b"speculative")).await.unwrap();
        let created = log.claim(Event::command(media_created("m", authorized_blob)), None).await.unwrap();
        created.finalize_local().await.unwrap();
        confirm(&log, &created).await;

        let modified = log.claim(Event::command(media_modified("m", speculative_blob)), None).await.unwrap();
        modified.finalize_local().await.unwrap();
        assert_eq!(
            log.read_media_content(&MediaId::new("m")).await.unwrap(),
            Some(Bytes::from_static(b"speculative"))
        );

        log.record_truth(&truth(1, "foreign"), None).await.unwrap();
        let entry = log.media_entry(&MediaId::new("m")).unwrap();
        assert_eq!(entry.blob_id(), Some(authorized_blob));
        assert!(entry.is_persisted);
        assert_eq!(
            log.read_media_content(&MediaId::new("m")).await.unwrap(),
            Some(Bytes::from_static(b"authorized"))
        );
        let rows = log.scribe.storage().read_medias(&partition()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].media_info.blob_id, Some(authorized_blob));
        let blobs = log.scribe.blobs();
        assert_eq!(blobs.blob_info(&authorized_blob).await.unwrap().unwrap().persist_ref_count, 1);
        assert_eq!(blobs.blob_info(&speculative_blob).await.unwrap().unwrap().persist_ref_count, 0);
    }

    #[tokio::test]
    async fn modification_of_unknown_media_needs_inheritance() {
        struct Prototype(BlobId);
        impl MediaInheritance for Prototype {
            fn resolve_inherited_media_info(&self, _media_id: &MediaId) -> Option<MediaInfo> {
                Some(MediaInfo {
                    blob_id: Some(self.0),
                    name: Some("inherited.txt".into()),
                    ..MediaInfo::default()
                })
            }
        }

        let blob_id = BlobId::for_content(b"x");
        let log = memory_log().await;
        let err = log.claim(Event::command(media_modified("m", blob_id)), None).await.unwrap_err();
        assert!(matches!(err, ScribeError::StorageIntegrity { .. }));

        let options = PartitionOptions {
            inheritance: Some(Arc::new(Prototype(BlobId::for_content(b"old")))),
            ..PartitionOptions::default()
        };
        let log = open(Arc::new(InMemoryStorage::new()), ScribeConfig::default(), options).await;
        log.claim(Event::command(media_modified("m", blob_id)), None).await.unwrap();
        let entry = log.media_entry(&MediaId::new("m")).unwrap();
        assert_eq!(entry.media_info.name.as_deref(), Some("inherited.txt"));
        assert_eq!(entry.blob_id(), Some(blob_id));
    }

    #[tokio::test]
    async fn prepared_blob_is_readable_through_media() {
        let log = memory_log().await;
        let blob_id = log.prepare_blob(Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        let claimed = log
            .claim(
                Event::command(Action::Created {
                    id: "doc".into(),
                    type_name: MEDIA_TYPE_NAME.into(),
                    initial_state: json!({ "content": blob_id, "mediaType": { "type": "application", "subtype": "json" } }),
                }),
                None,
            )
            .await
            .unwrap();
        claimed.finalize_local().await.unwrap();
        assert_eq!(
            log.read_media_content(&MediaId::new("doc")).await.unwrap(),
            Some(Bytes::from_static(b"{\"a\":1}"))
        );
        confirm(&log, &claimed).await;
        assert_eq!(
            log.scribe.blobs().blob_info(&blob_id).await.unwrap().unwrap().persist_ref_count,
            1
        );
        log.disconnect().await.unwrap();
        assert!(log.media_entry(&MediaId::new("doc")).is_none());
    }
}
