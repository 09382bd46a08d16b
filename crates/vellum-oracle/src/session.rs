use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vellum_authority::{
    AuthorityConnection, AuthorityNexus, AuthorityRoute, ContentRetriever, DecoderArray, NarrateOptions, Narration,
    UnavailableRetriever,
};
use vellum_scribe::{
    run_with_retries, MediaInheritance, PartitionOptions, RetrievalFailure, RetrievalReport, Scribe,
    ScribePartitionConnection,
};
use vellum_types::{BlobId, Event, EventId, MediaId, PartitionUri};

use crate::config::OracleConfig;
use crate::error::{OracleError, OracleResult};
use crate::follower::{FollowerEvent, FollowerStream, Followers};
use crate::plan::{NarrationPlan, NarrationRange, NarrationSource};
use crate::truth_queue::{TruthQueue, TruthQueueEntry};

/// Lifecycle of a session. `Connected` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Narrating,
    Connected,
    Failed,
}

/// Where a confirmed truth came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruthOrigin {
    /// The explicit event log of a narration.
    EventLog,
    /// A narration of the remote authority.
    Authority,
    /// The remote authority's truth stream.
    Stream,
    /// The result of chronicling a local command.
    Chronicle,
    /// A local command confirmed by a self-authoritative partition.
    Local,
    /// The next queued command of a self-authoritative partition.
    PreAuthorized,
}

/// Options of [`OraclePartitionConnection::connect`].
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// The caller expects the partition to have no history yet.
    pub create_new_partition: bool,
    pub narrate: NarrateOptions,
    pub inheritance: Option<Arc<dyn MediaInheritance>>,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("create_new_partition", &self.create_new_partition)
            .field("narrate", &self.narrate)
            .field("inheritance", &self.inheritance.is_some())
            .finish()
    }
}

/// Outcome of a successful connect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectReport {
    /// Truths and commands yielded by the initial narration.
    pub narrated_actions: usize,
    /// Retrieval failures that did not block the connect.
    pub intermediate_failures: Vec<RetrievalFailure>,
    pub retries: u64,
}

#[derive(Clone)]
enum RemoteState {
    Pending,
    Remote(Arc<dyn AuthorityConnection>),
    Local,
    Unavailable(String),
}

/// Reconciliation session of one partition.
///
/// Composes the partition's local log with the remote authority connection,
/// resolved in the background when the session opens. Truths from every
/// origin pass through [`on_confirm_truth`](Self::on_confirm_truth) into an
/// ordered queue that is applied strictly in event id order.
pub struct OraclePartitionConnection {
    partition: PartitionUri,
    config: Arc<OracleConfig>,
    local: Arc<ScribePartitionConnection>,
    remote: watch::Sender<RemoteState>,
    state: Mutex<SessionState>,
    truths: Mutex<TruthQueue>,
    apply_lock: tokio::sync::Mutex<()>,
    claim_lock: tokio::sync::Mutex<()>,
    followers: Followers,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    report: Mutex<Option<ConnectReport>>,
}

impl OraclePartitionConnection {
    /// Connect the local log and start resolving the remote authority.
    pub async fn open(
        scribe: &Arc<Scribe>,
        nexus: Arc<AuthorityNexus>,
        partition: PartitionUri,
        inheritance: Option<Arc<dyn MediaInheritance>>,
        config: Arc<OracleConfig>,
    ) -> OracleResult<Arc<Self>> {
        let self_authoritative = match nexus.authority_for(&partition) {
            Ok(authority) => authority.is_local(),
            Err(e) => {
                debug!(%partition, error = %e, "no authority known yet");
                false
            }
        };
        let local = scribe
            .connect_partition(
                partition.clone(),
                PartitionOptions {
                    inheritance,
                    self_authoritative,
                },
            )
            .await?;

        let (remote, _) = watch::channel(RemoteState::Pending);
        let session = Arc::new(Self {
            followers: Followers::new(config.followers.channel_capacity),
            partition: partition.clone(),
            config,
            local,
            remote,
            state: Mutex::new(SessionState::Unconnected),
            truths: Mutex::new(TruthQueue::new()),
            apply_lock: tokio::sync::Mutex::new(()),
            claim_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            report: Mutex::new(None),
        });
        let resolver = tokio::spawn(resolve_remote(Arc::downgrade(&session), nexus, partition));
        session.tasks().push(resolver);
        Ok(session)
    }

    pub fn partition_uri(&self) -> &PartitionUri {
        &self.partition
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// The local partition log behind this session.
    pub fn local(&self) -> &Arc<ScribePartitionConnection> {
        &self.local
    }

    pub fn connect_report(&self) -> Option<ConnectReport> {
        self.report.lock().expect("lock poisoned").clone()
    }

    pub fn retrieval_report(&self) -> RetrievalReport {
        self.local.tracker().report()
    }

    pub fn subscribe(&self) -> FollowerStream {
        self.followers.subscribe()
    }

    /// Truths waiting for an earlier truth.
    pub fn queued_truths(&self) -> usize {
        self.truths().len()
    }

    fn truths(&self) -> MutexGuard<'_, TruthQueue> {
        self.truths.lock().expect("lock poisoned")
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().expect("lock poisoned")
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("lock poisoned") = next;
    }

    fn ensure_usable(&self) -> OracleResult<()> {
        match self.state() {
            SessionState::Failed => Err(OracleError::SessionFailed(self.partition.to_string())),
            _ => Ok(()),
        }
    }

    fn ensure_connected(&self) -> OracleResult<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            SessionState::Failed => Err(OracleError::SessionFailed(self.partition.to_string())),
            _ => Err(OracleError::NotConnected(self.partition.to_string())),
        }
    }

    /// Narrate the partition and check the result against `opts`.
    ///
    /// Fails with an intent conflict when no history exists and
    /// `create_new_partition` is unset, or when history exists and it is
    /// set. Fails when the latest content of a media could not be retrieved
    /// and the narration requires it. Any failure leaves the session failed.
    pub async fn connect(self: &Arc<Self>, opts: ConnectOptions) -> OracleResult<ConnectReport> {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            match *state {
                SessionState::Unconnected => *state = SessionState::Narrating,
                SessionState::Connected => return Ok(self.connect_report().unwrap_or_default()),
                SessionState::Narrating => return Err(OracleError::NotConnected(self.partition.to_string())),
                SessionState::Failed => return Err(OracleError::SessionFailed(self.partition.to_string())),
            }
        }

        match self.connect_inner(&opts).await {
            Ok(report) => {
                *self.report.lock().expect("lock poisoned") = Some(report.clone());
                self.set_state(SessionState::Connected);
                info!(
                    partition = %self.partition,
                    actions = report.narrated_actions,
                    intermediate_failures = report.intermediate_failures.len(),
                    retries = report.retries,
                    "session connected"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                warn!(partition = %self.partition, error = %e, "session failed to connect");
                Err(e)
            }
        }
    }

    async fn connect_inner(self: &Arc<Self>, opts: &ConnectOptions) -> OracleResult<ConnectReport> {
        let narration = self.narrate(opts.narrate.clone()).await?;
        let narrated_actions = narration.len();

        if narrated_actions == 0 && !opts.create_new_partition {
            return Err(OracleError::IntentConflict {
                partition: self.partition.to_string(),
                reason: "partition has no history and create_new_partition is not set".into(),
            });
        }
        if narrated_actions > 0 && opts.create_new_partition {
            return Err(OracleError::IntentConflict {
                partition: self.partition.to_string(),
                reason: format!("create_new_partition is set but {narrated_actions} actions were narrated"),
            });
        }

        if self.local.options().self_authoritative {
            self.confirm_queued_head().await?;
        }

        let retriever = opts
            .narrate
            .retrieve_media_content
            .clone()
            .or_else(|| self.resolved_remote().map(|remote| remote.content_retriever()));
        if let Some(retriever) = retriever {
            let fetched = self.local.ensure_media_contents(retriever).await?;
            debug!(partition = %self.partition, fetched, "media contents ensured");
        }

        let report = self.local.tracker().report();
        for failure in &report.intermediate_failures {
            warn!(
                partition = %self.partition,
                media = %failure.media_id,
                attempt = failure.attempt,
                error = %failure.error,
                "intermediate media retrieval failure"
            );
        }
        if !report.latest_failures.is_empty() {
            let required =
                opts.narrate.require_latest_media_contents && self.config.narration.require_latest_media_contents;
            if required {
                return Err(OracleError::MediaRetrieval {
                    partition: self.partition.to_string(),
                    failures: report.latest_failures,
                });
            }
            warn!(
                partition = %self.partition,
                count = report.latest_failures.len(),
                "latest media contents unavailable"
            );
        }

        Ok(ConnectReport {
            narrated_actions,
            intermediate_failures: report.intermediate_failures,
            retries: report.overall_retries,
        })
    }

    /// Confirm a command left queued by an earlier session of a
    /// self-authoritative partition. The rest follow by pre-authorization.
    async fn confirm_queued_head(&self) -> OracleResult<()> {
        let queue = self.local.command_queue_info().await;
        if queue.is_empty() {
            return Ok(());
        }
        let opts = NarrateOptions::default()
            .with_command_callback(|_| Value::Null)
            .with_range(Some(queue.first_event_id), Some(queue.first_event_id));
        let narration = self.local.narrate(&opts).await?;
        if let Some((_, head)) = narration.commands.into_iter().next() {
            debug!(partition = %self.partition, event_id = queue.first_event_id, "confirming queued command");
            self.on_confirm_truth(TruthOrigin::Local, head).await?;
        }
        Ok(())
    }

    /// Narrate from the explicit event log, the local log and the remote
    /// authority, in that order, stopping at the first source that covers
    /// the requested range.
    ///
    /// Without an explicit event log, a narration that did not reach the
    /// authority starts a background catch-up from it.
    pub async fn narrate(self: &Arc<Self>, opts: NarrateOptions) -> OracleResult<Narration> {
        self.ensure_usable()?;
        let plan = NarrationPlan::build(&opts, true);
        let mut range = plan.range();
        let mut narration = Narration::default();
        let mut consulted_authority = false;

        for source in plan.sources() {
            let produced = match source {
                NarrationSource::EventLog => self.narrate_event_log(&opts, range).await?,
                NarrationSource::LocalLog => self.local.narrate(&range.apply(&opts)).await?,
                NarrationSource::Authority => {
                    consulted_authority = true;
                    self.narrate_authority(&opts, range).await?
                }
            };
            let yielded = produced.len();
            let produced_last = produced.last_event_id();
            debug!(partition = %self.partition, ?source, yielded, "narration source done");
            narration.extend(produced);
            if plan.should_stop(yielded, narration.last_event_id()) {
                break;
            }
            range = range.after(produced_last);
        }

        if !consulted_authority && opts.event_log.is_none() && !opts.dont_remote_narrate {
            self.spawn_background_narration();
        }
        info!(
            partition = %self.partition,
            truths = narration.truths.len(),
            commands = narration.commands.len(),
            "narration complete"
        );
        Ok(narration)
    }

    async fn narrate_event_log(&self, opts: &NarrateOptions, range: NarrationRange) -> OracleResult<Narration> {
        let Some(events) = &opts.event_log else {
            return Ok(Narration::default());
        };
        let mut expected = range.first_event_id;
        let mut truths = Vec::new();
        for event in events {
            let event_id = self.event_id_of(event)?;
            if range.first_event_id.is_some_and(|first| event_id < first) {
                continue;
            }
            if range.last_event_id.is_some_and(|last| event_id > last) {
                break;
            }
            if let Some(expected) = expected {
                if event_id != expected {
                    return Err(self.fail_with(OracleError::EventLogGap {
                        partition: self.partition.to_string(),
                        expected,
                        actual: event_id,
                    }));
                }
            }
            expected = Some(event_id + 1);
            if let Some(callback) = &opts.callback {
                callback(event);
            }
            self.confirm_truth(TruthOrigin::EventLog, event.clone(), opts.retrieve_media_content.clone())
                .await?;
            truths.push((event_id, event.clone()));
        }
        Ok(Narration {
            truths,
            commands: Vec::new(),
        })
    }

    async fn narrate_authority(&self, opts: &NarrateOptions, range: NarrationRange) -> OracleResult<Narration> {
        let Some(remote) = self.remote_connection().await else {
            return Ok(Narration::default());
        };
        let next = self.local.event_log_info().await.next_event_id();
        let mut remote_opts = NarrateOptions::default().with_range(
            Some(range.first_event_id.map_or(next, |first| first.max(next))),
            range.last_event_id,
        );
        remote_opts.callback = opts.callback.clone();
        let narration = remote.narrate(&remote_opts).await?;
        let retriever = opts
            .retrieve_media_content
            .clone()
            .unwrap_or_else(|| remote.content_retriever());
        for (_, truth) in &narration.truths {
            self.confirm_truth(TruthOrigin::Authority, truth.clone(), Some(Arc::clone(&retriever)))
                .await?;
        }
        Ok(Narration {
            truths: narration.truths,
            commands: Vec::new(),
        })
    }

    /// Narrate the authority from the next expected event id and confirm
    /// every truth it yields.
    pub async fn catch_up(&self) -> OracleResult<usize> {
        let Some(remote) = self.remote_connection().await else {
            return Ok(0);
        };
        let next = self.local.event_log_info().await.next_event_id();
        let narration = remote
            .narrate(&NarrateOptions::default().with_range(Some(next), None))
            .await?;
        let count = narration.truths.len();
        for (_, truth) in narration.truths {
            self.on_confirm_truth(TruthOrigin::Authority, truth).await?;
        }
        debug!(partition = %self.partition, count, "caught up with authority");
        Ok(count)
    }

    fn spawn_background_narration(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut route = self.remote.subscribe();
        let task = tokio::spawn(async move {
            let resolved = route.wait_for(|s| !matches!(s, RemoteState::Pending)).await.is_ok();
            if !resolved {
                return;
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            if let Err(e) = session.catch_up().await {
                warn!(partition = %session.partition, error = %e, "background narration failed");
            }
        });
        self.tasks().push(task);
    }

    /// Queue a truth at its offset from the next expected event id and
    /// apply every truth that is now in order.
    ///
    /// Truths already recorded or already queued are ignored. Returns the
    /// queue head when application stopped at a multi-partition truth.
    pub async fn on_confirm_truth(&self, origin: TruthOrigin, truth: Event) -> OracleResult<Option<Event>> {
        self.confirm_truth(origin, truth, None).await
    }

    async fn confirm_truth(
        &self,
        origin: TruthOrigin,
        truth: Event,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> OracleResult<Option<Event>> {
        self.ensure_usable()?;
        let result = self.confirm_truth_locked(origin, truth, retriever).await;
        result.map_err(|e| self.fail_with(e))
    }

    async fn confirm_truth_locked(
        &self,
        origin: TruthOrigin,
        truth: Event,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> OracleResult<Option<Event>> {
        let event_id = self.event_id_of(&truth)?;
        let _apply = self.apply_lock.lock().await;
        let next = self.local.event_log_info().await.next_event_id();
        if event_id < next {
            debug!(partition = %self.partition, ?origin, event_id, "truth already recorded");
            return Ok(None);
        }
        self.enqueue(origin, truth, event_id, next, retriever).await?;
        self.unwind_single().await
    }

    async fn enqueue(
        &self,
        origin: TruthOrigin,
        truth: Event,
        event_id: EventId,
        next: EventId,
        retriever: Option<Arc<dyn ContentRetriever>>,
    ) -> OracleResult<()> {
        let ahead = event_id - next;
        let max_ahead = self.config.narration.max_truth_queue_ahead;
        let offset = usize::try_from(ahead)
            .ok()
            .filter(|_| ahead <= max_ahead)
            .ok_or_else(|| OracleError::ProtocolViolation {
                partition: self.partition.to_string(),
                reason: format!("event id {event_id} is more than {max_ahead} ahead of {next}"),
            })?;
        if self.truths().is_occupied(offset) {
            debug!(partition = %self.partition, ?origin, event_id, "truth already queued");
            return Ok(());
        }
        let retriever = retriever.unwrap_or_else(|| self.current_retriever());
        let finalizers = self.local.create_finalizers(&truth, event_id, Some(retriever)).await?;
        self.truths()
            .insert(offset, TruthQueueEntry::new(truth, event_id, finalizers));
        debug!(partition = %self.partition, ?origin, event_id, offset, "truth queued");
        Ok(())
    }

    /// Apply queued truths from the head while they touch only this
    /// partition. Must run under the apply lock.
    async fn unwind_single(&self) -> OracleResult<Option<Event>> {
        loop {
            let (event, event_id, finalizers) = {
                let mut truths = self.truths();
                let Some(head) = truths.head_mut() else {
                    return Ok(None);
                };
                if head.event.is_multi_partition() {
                    debug!(partition = %self.partition, event_id = head.event_id, "multi-partition truth at queue head");
                    return Ok(Some(head.event.clone()));
                }
                head.locked = true;
                (head.event.clone(), head.event_id, std::mem::take(&mut head.finalizers))
            };

            let pre_authorized = Mutex::new(Vec::new());
            let pre_authorize = |command: Event| pre_authorized.lock().expect("lock poisoned").push(command);
            let record = match self.local.record_truth(&event, Some(&pre_authorize)).await {
                Ok(record) => record,
                Err(e) => {
                    if let Some(head) = self.truths().head_mut() {
                        head.locked = false;
                        head.finalizers = finalizers;
                    }
                    return Err(e.into());
                }
            };

            let entry = {
                let mut truths = self.truths();
                if let Some(head) = truths.head_mut() {
                    if !record.purged_commands.is_empty() {
                        head.purged_commands = Some(record.purged_commands.clone());
                    }
                }
                truths.pop_head()
            };
            if let Some(purged) = entry.and_then(|entry| entry.purged_commands) {
                self.followers.publish(FollowerEvent::CommandsPurged(purged));
            }

            run_with_retries(&self.config.finalizers, "truth finalizer", || {
                self.local.run_finalizers(&finalizers)
            })
            .await?;

            if record.recorded {
                debug!(partition = %self.partition, event_id, command_id = %event.command_id, "truth applied");
                self.followers.publish(FollowerEvent::Truth(event));
            }

            let pre_authorized = pre_authorized.into_inner().expect("lock poisoned");
            for command in pre_authorized {
                let command_id = self.event_id_of(&command)?;
                let next = self.local.event_log_info().await.next_event_id();
                if command_id >= next {
                    self.enqueue(TruthOrigin::PreAuthorized, command, command_id, next, None)
                        .await?;
                }
            }
        }
    }

    fn event_id_of(&self, event: &Event) -> OracleResult<EventId> {
        event
            .event_id_for(&self.partition)
            .ok_or_else(|| OracleError::ProtocolViolation {
                partition: self.partition.to_string(),
                reason: format!("event {} has no event id for this partition", event.command_id),
            })
    }

    /// Mark the session failed when `error` is fatal, and return it.
    fn fail_with(&self, error: OracleError) -> OracleError {
        if error.is_fatal() {
            self.set_state(SessionState::Failed);
            warn!(partition = %self.partition, error = %error, "session failed");
        }
        error
    }

    /// Queue `command` locally and send it to the authority.
    ///
    /// A remote authority chronicles the command. On a self-authoritative
    /// partition the command is confirmed directly when it heads the queue.
    /// Without any reachable authority the command stays queued.
    pub async fn claim(self: &Arc<Self>, command: Event) -> OracleResult<Event> {
        self.ensure_connected()?;
        let _claim = self.claim_lock.lock().await;
        let claimed = self.local.claim(command, Some(self.current_retriever())).await?;
        claimed.finalize_local().await?;
        let event = claimed.event.clone();

        match self.route().await {
            RemoteState::Remote(remote) => {
                let truth = remote.chronicle(&event).await?;
                self.on_confirm_truth(TruthOrigin::Chronicle, truth).await?;
            }
            RemoteState::Local => {
                if self.local.command_queue_info().await.first_event_id == claimed.event_id {
                    self.on_confirm_truth(TruthOrigin::Local, event.clone()).await?;
                }
            }
            RemoteState::Unavailable(reason) => {
                warn!(partition = %self.partition, %reason, "no authority; command stays queued");
            }
            RemoteState::Pending => {}
        }
        debug!(partition = %self.partition, event_id = claimed.event_id, "command claimed");
        Ok(event)
    }

    /// Media content from the local blob store, else from the authority.
    pub async fn read_media_content(&self, media_id: &MediaId) -> OracleResult<Option<Bytes>> {
        self.ensure_usable()?;
        let info = self
            .local
            .media_info(media_id)
            .ok_or_else(|| OracleError::UnknownMedia(media_id.to_string()))?;
        if let Some(content) = self.local.read_media_content(media_id).await? {
            return Ok(Some(content));
        }
        match self.remote_connection().await {
            Some(remote) => Ok(remote.read_media_content(media_id, &info).await?),
            None => Ok(None),
        }
    }

    /// Decode locally stored media content.
    pub async fn decode_media_content(
        &self,
        media_id: &MediaId,
        decoders: Option<&DecoderArray>,
    ) -> OracleResult<Option<Value>> {
        self.ensure_usable()?;
        Ok(self.local.decode_media_content(media_id, decoders).await?)
    }

    /// URL of the local content, else the authority's URL for it.
    pub async fn get_media_url(&self, media_id: &MediaId) -> OracleResult<Option<String>> {
        self.ensure_usable()?;
        let info = self
            .local
            .media_info(media_id)
            .ok_or_else(|| OracleError::UnknownMedia(media_id.to_string()))?;
        if let Some(url) = self.local.get_media_url(media_id).await? {
            return Ok(Some(url));
        }
        match self.remote_connection().await {
            Some(remote) => Ok(remote.get_media_url(media_id, &info).await?),
            None => Ok(None),
        }
    }

    /// Store content locally and, when `mirror` is set, on the authority.
    pub async fn prepare_blob(&self, content: Bytes, mirror: bool) -> OracleResult<BlobId> {
        self.ensure_usable()?;
        let blob_id = self.local.prepare_blob(content.clone()).await?;
        if mirror {
            if let Some(remote) = self.remote_connection().await {
                let remote_id = remote.prepare_blob(content).await?;
                if remote_id != blob_id {
                    warn!(partition = %self.partition, %blob_id, %remote_id, "authority stored blob under another id");
                }
            }
        }
        Ok(blob_id)
    }

    async fn route(&self) -> RemoteState {
        let mut route = self.remote.subscribe();
        let resolved = route
            .wait_for(|s| !matches!(s, RemoteState::Pending))
            .await
            .map(|state| state.clone());
        resolved.unwrap_or_else(|_| RemoteState::Unavailable("authority resolution stopped".into()))
    }

    /// The remote authority connection, once resolved. `None` for
    /// self-authoritative partitions and unreachable authorities.
    pub async fn remote_connection(&self) -> Option<Arc<dyn AuthorityConnection>> {
        match self.route().await {
            RemoteState::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    fn resolved_remote(&self) -> Option<Arc<dyn AuthorityConnection>> {
        match &*self.remote.borrow() {
            RemoteState::Remote(remote) => Some(Arc::clone(remote)),
            _ => None,
        }
    }

    /// The authority's retriever when one is resolved, else one that fails
    /// every fetch.
    fn current_retriever(&self) -> Arc<dyn ContentRetriever> {
        match self.resolved_remote() {
            Some(remote) => remote.content_retriever(),
            None => Arc::new(UnavailableRetriever::new("no remote authority connection")),
        }
    }

    /// Stop background work and release the local log.
    pub async fn disconnect(&self) -> OracleResult<()> {
        self.abort_tasks();
        self.truths().clear();
        self.local.disconnect().await?;
        info!(partition = %self.partition, "session disconnected");
        Ok(())
    }

    fn abort_tasks(&self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

impl Drop for OraclePartitionConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl std::fmt::Debug for OraclePartitionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OraclePartitionConnection")
            .field("partition", &self.partition)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn resolve_remote(session: Weak<OraclePartitionConnection>, nexus: Arc<AuthorityNexus>, partition: PartitionUri) {
    let state = match nexus.obtain_authority_connection(&partition).await {
        Ok(AuthorityRoute::Local) => RemoteState::Local,
        Ok(AuthorityRoute::Remote(remote)) => RemoteState::Remote(remote),
        Err(e) => {
            warn!(%partition, error = %e, "authority unavailable");
            RemoteState::Unavailable(e.to_string())
        }
    };
    let Some(session) = session.upgrade() else {
        return;
    };
    if let RemoteState::Remote(remote) = &state {
        let pump = tokio::spawn(pump_truths(Arc::downgrade(&session), remote.subscribe_truths()));
        session.tasks().push(pump);
    }
    debug!(%partition, "authority resolved");
    session.remote.send_replace(state);
}

/// Feed the authority's truth stream into the session.
async fn pump_truths(session: Weak<OraclePartitionConnection>, mut truths: broadcast::Receiver<Event>) {
    loop {
        let received = truths.recv().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        match received {
            Ok(truth) => {
                if let Err(e) = session.on_confirm_truth(TruthOrigin::Stream, truth).await {
                    warn!(partition = %session.partition, error = %e, "streamed truth rejected");
                    if session.state() == SessionState::Failed {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(partition = %session.partition, skipped, "truth stream lagged; catching up");
                if let Err(e) = session.catch_up().await {
                    warn!(partition = %session.partition, error = %e, "catch-up failed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
