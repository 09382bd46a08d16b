use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;
use tracing::{info, warn};
use vellum_authority::{AuthorityNexus, LocalSchemeModule};
use vellum_scribe::Scribe;
use vellum_types::PartitionUri;

use crate::config::OracleConfig;
use crate::error::OracleResult;
use crate::session::{ConnectOptions, OraclePartitionConnection};

type SessionSlot = Arc<OnceCell<Arc<OraclePartitionConnection>>>;

/// Registry of reconciliation sessions, one per partition URI.
///
/// All sessions share one [`Scribe`] and one [`AuthorityNexus`].
pub struct Oracle {
    scribe: Arc<Scribe>,
    nexus: Arc<AuthorityNexus>,
    config: Arc<OracleConfig>,
    sessions: Mutex<HashMap<PartitionUri, SessionSlot>>,
}

impl Oracle {
    /// Open the configured storage, sweep unreferenced blobs and register
    /// the `vellum-local` scheme.
    pub async fn new(config: OracleConfig) -> OracleResult<Self> {
        let storage = config.open_storage()?;
        let scribe = Scribe::new(storage, config.scribe_config());
        scribe.initialize().await?;
        let nexus = AuthorityNexus::new();
        nexus.register_scheme_module(Arc::new(LocalSchemeModule))?;
        Ok(Self::with_parts(scribe, Arc::new(nexus), config))
    }

    pub fn with_parts(scribe: Arc<Scribe>, nexus: Arc<AuthorityNexus>, config: OracleConfig) -> Self {
        Self {
            scribe,
            nexus,
            config: Arc::new(config),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn scribe(&self) -> &Arc<Scribe> {
        &self.scribe
    }

    pub fn nexus(&self) -> &Arc<AuthorityNexus> {
        &self.nexus
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<PartitionUri, SessionSlot>> {
        self.sessions.lock().expect("lock poisoned")
    }

    /// The connected session of `partition`, opening and connecting it on
    /// first use. Concurrent callers share one connect; a failed connect is
    /// retried by the next caller.
    pub async fn acquire_connection(
        &self,
        partition: &PartitionUri,
        opts: ConnectOptions,
    ) -> OracleResult<Arc<OraclePartitionConnection>> {
        let slot = Arc::clone(self.sessions().entry(partition.clone()).or_default());
        let session = slot
            .get_or_try_init(|| async {
                let session = OraclePartitionConnection::open(
                    &self.scribe,
                    Arc::clone(&self.nexus),
                    partition.clone(),
                    opts.inheritance.clone(),
                    Arc::clone(&self.config),
                )
                .await?;
                if let Err(e) = session.connect(opts.clone()).await {
                    if let Err(release) = session.disconnect().await {
                        warn!(%partition, error = %release, "releasing failed session");
                    }
                    return Err(e);
                }
                Ok(session)
            })
            .await?;
        Ok(Arc::clone(session))
    }

    /// The session of `partition` if it is connected.
    pub fn session(&self, partition: &PartitionUri) -> Option<Arc<OraclePartitionConnection>> {
        self.sessions().get(partition).and_then(|slot| slot.get().cloned())
    }

    /// Disconnect and forget the session of `partition`.
    pub async fn release_connection(&self, partition: &PartitionUri) -> OracleResult<bool> {
        let slot = self.sessions().remove(partition);
        let Some(session) = slot.and_then(|slot| slot.get().cloned()) else {
            return Ok(false);
        };
        session.disconnect().await?;
        self.nexus.release_connection(partition).await;
        info!(%partition, "session released");
        Ok(true)
    }

    /// Commands queued across every partition.
    pub fn command_count(&self) -> usize {
        self.scribe.command_count()
    }
}

impl std::fmt::Debug for Oracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracle")
            .field("sessions", &self.sessions().len())
            .field("nexus", &self.nexus)
            .finish_non_exhaustive()
    }
}
