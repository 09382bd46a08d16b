use async_trait::async_trait;
use bytes::Bytes;
use vellum_types::{BlobId, Event, EventId, PartitionUri};

use crate::batch::{BlobRow, LogTable, MediaRow, StorageBatch};
use crate::error::StoreResult;

/// Durable storage behind the local partition logs and the blob store.
///
/// All implementations must satisfy these invariants:
/// - A committed [`StorageBatch`] is visible in full or not at all, both to
///   concurrent readers and after a crash.
/// - Log reads return rows in ascending event id order.
/// - Missing rows read as `Ok(None)` or an empty vector.
/// - Partitions are keyed by their full URI.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// First and last key of a log table, or `None` when it is empty.
    async fn log_bounds(
        &self,
        partition: &PartitionUri,
        table: LogTable,
    ) -> StoreResult<Option<(EventId, EventId)>>;

    /// Rows with keys in `first..=last`.
    async fn read_log(
        &self,
        partition: &PartitionUri,
        table: LogTable,
        first: EventId,
        last: EventId,
    ) -> StoreResult<Vec<(EventId, Event)>>;

    /// A single log row.
    async fn read_log_entry(
        &self,
        partition: &PartitionUri,
        table: LogTable,
        event_id: EventId,
    ) -> StoreResult<Option<Event>> {
        let mut rows = self.read_log(partition, table, event_id, event_id).await?;
        Ok(rows.pop().map(|(_, event)| event))
    }

    /// Every media row of a partition, ordered by media id.
    async fn read_medias(&self, partition: &PartitionUri) -> StoreResult<Vec<MediaRow>>;

    async fn read_blob(&self, blob_id: &BlobId) -> StoreResult<Option<BlobRow>>;

    /// Every row of the shared `blobs` table.
    async fn list_blobs(&self) -> StoreResult<Vec<BlobRow>>;

    async fn read_buffer(&self, blob_id: &BlobId) -> StoreResult<Option<Bytes>>;

    /// Apply a batch atomically.
    async fn commit(&self, batch: StorageBatch) -> StoreResult<()>;
}
