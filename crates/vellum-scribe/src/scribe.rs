use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;
use vellum_authority::DecoderArray;
use vellum_store::LocalStorage;
use vellum_types::PartitionUri;

use crate::blob::BlobStore;
use crate::connection::{PartitionOptions, ScribePartitionConnection};
use crate::error::ScribeResult;
use crate::retrieval::RetrievalConfig;

/// Configuration shared by every partition log of a [`Scribe`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScribeConfig {
    /// Keep speculative commands in memory only.
    pub transient: bool,
    pub retrieval: RetrievalConfig,
}

/// Local side of every partition: shared storage, blob store and decoders,
/// plus the aggregate count of queued commands across partitions.
pub struct Scribe {
    storage: Arc<dyn LocalStorage>,
    blobs: Arc<BlobStore>,
    decoders: Arc<DecoderArray>,
    config: ScribeConfig,
    command_counts: Mutex<HashMap<PartitionUri, usize>>,
    total_commands: watch::Sender<usize>,
}

impl Scribe {
    pub fn new(storage: Arc<dyn LocalStorage>, config: ScribeConfig) -> Arc<Self> {
        Self::with_decoders(storage, config, Arc::new(DecoderArray::with_builtins()))
    }

    pub fn with_decoders(storage: Arc<dyn LocalStorage>, config: ScribeConfig, decoders: Arc<DecoderArray>) -> Arc<Self> {
        let (total_commands, _) = watch::channel(0);
        Arc::new(Self {
            blobs: Arc::new(BlobStore::new(Arc::clone(&storage))),
            storage,
            decoders,
            config,
            command_counts: Mutex::new(HashMap::new()),
            total_commands,
        })
    }

    /// Sweep unreferenced blobs. Idempotent.
    pub async fn initialize(&self) -> ScribeResult<()> {
        self.blobs.initialize().await?;
        Ok(())
    }

    /// Open the local log of `partition`.
    pub async fn connect_partition(
        self: &Arc<Self>,
        partition: PartitionUri,
        options: PartitionOptions,
    ) -> ScribeResult<Arc<ScribePartitionConnection>> {
        self.initialize().await?;
        ScribePartitionConnection::connect(Arc::clone(self), partition, options).await
    }

    pub fn storage(&self) -> &Arc<dyn LocalStorage> {
        &self.storage
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn decoders(&self) -> &Arc<DecoderArray> {
        &self.decoders
    }

    pub fn config(&self) -> &ScribeConfig {
        &self.config
    }

    /// Record the queue depth of one partition.
    pub(crate) fn report_command_count(&self, partition: &PartitionUri, count: usize) {
        let total = {
            let mut counts = self.command_counts.lock().expect("lock poisoned");
            if count == 0 {
                counts.remove(partition);
            } else {
                counts.insert(partition.clone(), count);
            }
            counts.values().sum::<usize>()
        };
        debug!(%partition, count, total, "command count");
        self.total_commands.send_replace(total);
    }

    /// Commands queued across all partitions.
    pub fn command_count(&self) -> usize {
        *self.total_commands.borrow()
    }

    pub fn subscribe_command_count(&self) -> watch::Receiver<usize> {
        self.total_commands.subscribe()
    }
}

impl std::fmt::Debug for Scribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scribe")
            .field("config", &self.config)
            .field("command_count", &self.command_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_store::InMemoryStorage;

    #[tokio::test]
    async fn command_count_aggregates_partitions() {
        let scribe = Scribe::new(Arc::new(InMemoryStorage::new()), ScribeConfig::default());
        let mut counts = scribe.subscribe_command_count();
        let a = PartitionUri::parse("vellum-local:///a").unwrap();
        let b = PartitionUri::parse("vellum-local:///b").unwrap();

        scribe.report_command_count(&a, 2);
        scribe.report_command_count(&b, 3);
        assert_eq!(scribe.command_count(), 5);
        assert!(counts.has_changed().unwrap());
        assert_eq!(*counts.borrow_and_update(), 5);

        scribe.report_command_count(&a, 0);
        assert_eq!(scribe.command_count(), 3);
    }

    #[test]
    fn config_defaults() {
        let config: ScribeConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.transient);
        assert_eq!(config.retrieval.max_attempts, 3);
        assert_eq!(config.retrieval.history_limit, 32);
    }
}
