use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use vellum_types::{BlobId, Event, EventId, PartitionUri};

use crate::batch::{BlobRow, LogTable, MediaRow, StorageBatch};
use crate::error::StoreResult;
use crate::tables::Tables;
use crate::traits::LocalStorage;

/// In-memory, map-based local storage.
///
/// Intended for tests, transient sessions and embedding. Batches are applied
/// under a single write lock, which makes them atomic for every reader.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of rows in the shared `blobs` table.
    pub async fn blob_count(&self) -> usize {
        self.tables.read().await.list_blobs().len()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStorage for InMemoryStorage {
    async fn log_bounds(
        &self,
        partition: &PartitionUri,
        table: LogTable,
    ) -> StoreResult<Option<(EventId, EventId)>> {
        Ok(self.tables.read().await.log_bounds(partition, table))
    }

    async fn read_log(
        &self,
        partition: &PartitionUri,
        table: LogTable,
        first: EventId,
        last: EventId,
    ) -> StoreResult<Vec<(EventId, Event)>> {
        Ok(self.tables.read().await.read_log(partition, table, first, last))
    }

    async fn read_medias(&self, partition: &PartitionUri) -> StoreResult<Vec<MediaRow>> {
        Ok(self.tables.read().await.read_medias(partition))
    }

    async fn read_blob(&self, blob_id: &BlobId) -> StoreResult<Option<BlobRow>> {
        Ok(self.tables.read().await.read_blob(blob_id))
    }

    async fn list_blobs(&self) -> StoreResult<Vec<BlobRow>> {
        Ok(self.tables.read().await.list_blobs())
    }

    async fn read_buffer(&self, blob_id: &BlobId) -> StoreResult<Option<Bytes>> {
        Ok(self.tables.read().await.read_buffer(blob_id))
    }

    async fn commit(&self, batch: StorageBatch) -> StoreResult<()> {
        self.tables.write().await.apply_batch(&batch);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage").finish_non_exhaustive()
    }
}
