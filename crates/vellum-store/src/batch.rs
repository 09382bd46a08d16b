use bytes::Bytes;
use serde::{Deserialize, Serialize};
use vellum_types::{BlobId, Event, EventId, MediaId, MediaInfo, PartitionUri};

/// The two per-partition event tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTable {
    /// Authorized truths.
    Events,
    /// Speculative commands awaiting authorization.
    Commands,
}

impl LogTable {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Commands => "commands",
        }
    }
}

/// Row of the shared `blobs` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRow {
    pub blob_id: BlobId,
    pub byte_length: u64,
    pub persist_ref_count: u64,
}

/// Row of a partition's `medias` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRow {
    pub media_id: MediaId,
    pub media_info: MediaInfo,
}

/// A single mutation inside a [`StorageBatch`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageOp {
    PutLogEntry {
        partition: PartitionUri,
        table: LogTable,
        event_id: EventId,
        event: Event,
    },
    /// Delete `first..=last` from a log table.
    DeleteLogRange {
        partition: PartitionUri,
        table: LogTable,
        first: EventId,
        last: EventId,
    },
    PutMedia {
        partition: PartitionUri,
        row: MediaRow,
    },
    DeleteMedia {
        partition: PartitionUri,
        media_id: MediaId,
    },
    PutBlob {
        row: BlobRow,
    },
    /// Remove a blob row together with its buffer.
    DeleteBlob {
        blob_id: BlobId,
    },
    PutBuffer {
        blob_id: BlobId,
        #[serde(with = "hex_bytes")]
        bytes: Bytes,
    },
}

/// An ordered group of mutations applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageBatch {
    ops: Vec<StorageOp>,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StorageOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn put_log_entry(
        &mut self,
        partition: &PartitionUri,
        table: LogTable,
        event_id: EventId,
        event: Event,
    ) -> &mut Self {
        self.push(StorageOp::PutLogEntry {
            partition: partition.clone(),
            table,
            event_id,
            event,
        })
    }

    pub fn delete_log_range(
        &mut self,
        partition: &PartitionUri,
        table: LogTable,
        first: EventId,
        last: EventId,
    ) -> &mut Self {
        self.push(StorageOp::DeleteLogRange {
            partition: partition.clone(),
            table,
            first,
            last,
        })
    }

    pub fn put_media(&mut self, partition: &PartitionUri, row: MediaRow) -> &mut Self {
        self.push(StorageOp::PutMedia {
            partition: partition.clone(),
            row,
        })
    }

    pub fn put_blob(&mut self, row: BlobRow) -> &mut Self {
        self.push(StorageOp::PutBlob { row })
    }

    pub fn delete_blob(&mut self, blob_id: BlobId) -> &mut Self {
        self.push(StorageOp::DeleteBlob { blob_id })
    }

    pub fn put_buffer(&mut self, blob_id: BlobId, bytes: Bytes) -> &mut Self {
        self.push(StorageOp::PutBuffer { blob_id, bytes })
    }

    pub fn ops(&self) -> &[StorageOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StorageOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Buffers are written to the journal as hex strings.
mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_serialize_as_hex() {
        let blob_id = BlobId::for_content(b"\x00\xff");
        let mut batch = StorageBatch::new();
        batch.put_buffer(blob_id, Bytes::from_static(b"\x00\xff"));
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["ops"][0]["op"], "put_buffer");
        assert_eq!(json["ops"][0]["bytes"], "00ff");
        let back: StorageBatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn builder_keeps_order() {
        let partition = PartitionUri::parse("vellum-local:///p").unwrap();
        let mut batch = StorageBatch::new();
        batch
            .delete_log_range(&partition, LogTable::Commands, 1, 2)
            .delete_blob(BlobId::for_content(b"x"));
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], StorageOp::DeleteLogRange { .. }));
        assert!(matches!(batch.ops()[1], StorageOp::DeleteBlob { .. }));
    }
}
