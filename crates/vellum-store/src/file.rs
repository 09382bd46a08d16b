use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vellum_types::{BlobId, Event, EventId, PartitionUri};

use crate::batch::{BlobRow, LogTable, MediaRow, StorageBatch};
use crate::error::{StoreError, StoreResult};
use crate::tables::Tables;
use crate::traits::LocalStorage;

/// Flush/sync strategy for the journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every committed batch.
    EveryWrite,
    /// Flush to the OS page cache only.
    #[default]
    OsDefault,
}

/// Configuration for a [`FileStorage`] journal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub sync_mode: SyncMode,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Append side of the journal file.
struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    sync_mode: SyncMode,
}

impl Journal {
    fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let offset = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            offset,
            sync_mode,
        })
    }

    /// Append one framed entry. Returns the byte offset of the entry.
    fn append(&mut self, payload: &[u8]) -> StoreResult<u64> {
        let entry_offset = self.offset;
        write_frame(&mut self.writer, payload)?;
        self.writer.flush()?;
        if self.sync_mode == SyncMode::EveryWrite {
            self.writer.get_ref().sync_all()?;
        }
        self.offset += (HEADER_SIZE + payload.len()) as u64;
        debug!(offset = entry_offset, len = payload.len(), "journal append");
        Ok(entry_offset)
    }
}

fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(payload)
}

fn encode_batch(batch: &StorageBatch) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(batch).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Batches read back from a journal file.
struct Recovered {
    batches: Vec<StorageBatch>,
    /// End of the last complete frame.
    valid_len: u64,
    file_len: u64,
}

/// Read every intact batch from a journal file.
///
/// Recovery stops at a torn tail. Entries whose CRC does not match, or that
/// fail to deserialize, are skipped.
fn recover(path: &Path) -> StoreResult<Recovered> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Recovered {
                batches: Vec::new(),
                valid_len: 0,
                file_len: 0,
            })
        }
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut batches = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
            warn!(offset, length, file_len, "torn journal tail; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated journal entry; stopping recovery");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        offset += HEADER_SIZE as u64 + length as u64;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping journal entry"
            );
            continue;
        }
        match serde_json::from_slice::<StorageBatch>(&payload) {
            Ok(batch) => batches.push(batch),
            Err(e) => warn!(offset, error = %e, "undecodable journal entry; skipping"),
        }
    }

    debug!(recovered = batches.len(), valid_len = offset, "journal recovery complete");
    Ok(Recovered {
        batches,
        valid_len: offset,
        file_len,
    })
}

/// Cut a torn tail off the journal so later appends follow the last
/// complete frame.
fn truncate_torn_tail(path: &Path, recovered: &Recovered) -> StoreResult<()> {
    if recovered.valid_len >= recovered.file_len {
        return Ok(());
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(recovered.valid_len)?;
    file.sync_all()?;
    warn!(
        path = %path.display(),
        valid_len = recovered.valid_len,
        dropped = recovered.file_len - recovered.valid_len,
        "truncated torn journal tail"
    );
    Ok(())
}

/// Local storage recovered from, and appended to, a single journal file.
///
/// Every committed [`StorageBatch`] becomes one CRC-framed journal entry
/// holding the JSON-encoded batch:
///
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (JSON StorageBatch)]
/// ```
///
/// The tables are rebuilt in memory at open time by replaying the journal.
/// A batch is applied to the tables only after its entry has been written,
/// so readers never observe a batch that could be lost.
pub struct FileStorage {
    path: PathBuf,
    journal: Arc<Mutex<Journal>>,
    tables: RwLock<Tables>,
    commit_lock: tokio::sync::Mutex<()>,
    config: JournalConfig,
}

impl FileStorage {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl AsRef<Path>, config: JournalConfig) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let recovered = recover(&path)?;
        truncate_torn_tail(&path, &recovered)?;
        let mut tables = Tables::default();
        for batch in &recovered.batches {
            tables.apply_batch(batch);
        }
        let journal = Journal::open(&path, config.sync_mode)?;
        info!(path = %path.display(), batches = recovered.batches.len(), "opened file storage");
        Ok(Self {
            path,
            journal: Arc::new(Mutex::new(journal)),
            tables: RwLock::new(tables),
            commit_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the journal in bytes.
    pub fn journal_len(&self) -> u64 {
        self.journal.lock().expect("journal mutex poisoned").offset
    }

    /// Rewrite the journal as a single snapshot batch.
    ///
    /// The snapshot is written to a temp file in the same directory and
    /// renamed over the journal, so a crash leaves either the old or the new
    /// journal in place.
    pub async fn compact(&self) -> StoreResult<()> {
        let _commit = self.commit_lock.lock().await;
        let snapshot = self.tables.read().await.snapshot();
        let payload = encode_batch(&snapshot)?;
        let path = self.path.clone();
        let journal = Arc::clone(&self.journal);
        let sync_mode = self.config.sync_mode;
        let ops = snapshot.len();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            if !payload.is_empty() && ops > 0 {
                write_frame(&mut temp, &payload)?;
            }
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| StoreError::Compaction {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let mut journal = journal.lock().expect("journal mutex poisoned");
            *journal = Journal::open(&path, sync_mode)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        info!(path = %self.path.display(), ops, "compacted journal");
        Ok(())
    }
}

#[async_trait]
impl LocalStorage for FileStorage {
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
        if batch.is_empty() {
            return Ok(());
        }
        let _commit = self.commit_lock.lock().await;
        let payload = encode_batch(&batch)?;
        let journal = Arc::clone(&self.journal);
        tokio::task::spawn_blocking(move || {
            journal
                .lock()
                .expect("journal mutex poisoned")
                .append(&payload)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;
        self.tables.write().await.apply_batch(&batch);
        Ok(())
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
