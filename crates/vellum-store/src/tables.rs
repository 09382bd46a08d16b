use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use vellum_types::{BlobId, Event, EventId, MediaId, PartitionUri};

use crate::batch::{BlobRow, LogTable, MediaRow, StorageBatch, StorageOp};

/// The five logical tables, shared by every backend.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    logs: HashMap<(PartitionUri, LogTable), BTreeMap<EventId, Event>>,
    medias: HashMap<PartitionUri, BTreeMap<MediaId, MediaRow>>,
    blobs: BTreeMap<BlobId, BlobRow>,
    buffers: HashMap<BlobId, Bytes>,
}

fn log_key(partition: &PartitionUri, table: LogTable) -> (PartitionUri, LogTable) {
    (partition.clone(), table)
}

impl Tables {
    pub(crate) fn apply_batch(&mut self, batch: &StorageBatch) {
        for op in batch.ops() {
            self.apply(op);
        }
    }

    pub(crate) fn apply(&mut self, op: &StorageOp) {
        match op {
            StorageOp::PutLogEntry {
                partition,
                table,
                event_id,
                event,
            } => {
                self.logs
                    .entry(log_key(partition, *table))
                    .or_default()
                    .insert(*event_id, event.clone());
            }
            StorageOp::DeleteLogRange {
                partition,
                table,
                first,
                last,
            } => {
                if first > last {
                    return;
                }
                let key = log_key(partition, *table);
                if let Some(log) = self.logs.get_mut(&key) {
                    let doomed: Vec<EventId> = log.range(*first..=*last).map(|(id, _)| *id).collect();
                    for id in doomed {
                        log.remove(&id);
                    }
                    if log.is_empty() {
                        self.logs.remove(&key);
                    }
                }
            }
            StorageOp::PutMedia { partition, row } => {
                self.medias
                    .entry(partition.clone())
                    .or_default()
                    .insert(row.media_id.clone(), row.clone());
            }
            StorageOp::DeleteMedia { partition, media_id } => {
                if let Some(medias) = self.medias.get_mut(partition) {
                    medias.remove(media_id);
                }
            }
            StorageOp::PutBlob { row } => {
                self.blobs.insert(row.blob_id, *row);
            }
            StorageOp::DeleteBlob { blob_id } => {
                self.blobs.remove(blob_id);
                self.buffers.remove(blob_id);
            }
            StorageOp::PutBuffer { blob_id, bytes } => {
                self.buffers.insert(*blob_id, bytes.clone());
            }
        }
    }

    pub(crate) fn log_bounds(&self, partition: &PartitionUri, table: LogTable) -> Option<(EventId, EventId)> {
        let log = self.logs.get(&log_key(partition, table))?;
        let first = log.keys().next()?;
        let last = log.keys().next_back()?;
        Some((*first, *last))
    }

    pub(crate) fn read_log(
        &self,
        partition: &PartitionUri,
        table: LogTable,
        first: EventId,
        last: EventId,
    ) -> Vec<(EventId, Event)> {
        if first > last {
            return Vec::new();
        }
        self.logs
            .get(&log_key(partition, table))
            .map(|log| {
                log.range(first..=last)
                    .map(|(id, event)| (*id, event.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn read_medias(&self, partition: &PartitionUri) -> Vec<MediaRow> {
        self.medias
            .get(partition)
            .map(|medias| medias.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn read_blob(&self, blob_id: &BlobId) -> Option<BlobRow> {
        self.blobs.get(blob_id).copied()
    }

    pub(crate) fn list_blobs(&self) -> Vec<BlobRow> {
        self.blobs.values().copied().collect()
    }

    pub(crate) fn read_buffer(&self, blob_id: &BlobId) -> Option<Bytes> {
        self.buffers.get(blob_id).cloned()
    }

    /// Express the full table contents as one batch.
    pub(crate) fn snapshot(&self) -> StorageBatch {
        let mut batch = StorageBatch::new();
        let mut logs: Vec<_> = self.logs.iter().collect();
        logs.sort_by(|a, b| a.0.cmp(b.0));
        for ((partition, table), log) in logs {
            for (event_id, event) in log {
                batch.put_log_entry(partition, *table, *event_id, event.clone());
            }
        }
        for (partition, medias) in &self.medias {
            for row in medias.values() {
                batch.put_media(partition, row.clone());
            }
        }
        for row in self.blobs.values() {
            batch.put_blob(*row);
        }
        for (blob_id, bytes) in &self.buffers {
            batch.put_buffer(*blob_id, bytes.clone());
        }
        batch
    }
}
