use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OnceCell, OwnedMutexGuard};
use tracing::{debug, info};
use vellum_authority::{DecodeContext, Decoder};
use vellum_store::{BlobRow, LocalStorage, StorageBatch};
use vellum_types::BlobId;

use crate::error::{ScribeError, ScribeResult};

/// Diagnostic snapshot of one blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub blob_id: BlobId,
    /// `None` when the blob has no persisted row.
    pub byte_length: Option<u64>,
    pub persist_ref_count: u64,
    pub in_memory_ref_count: u64,
    pub has_buffer: bool,
    pub decodings: usize,
}

/// In-memory side of a blob: held only while something references it.
#[derive(Default)]
struct CachedBlob {
    in_memory_refs: u64,
    buffer: Option<Bytes>,
    decodings: HashMap<String, Value>,
}

/// Shared, content-addressed byte store with dual reference counting.
///
/// Persisted refs count media rows that point at a blob; the row is never
/// deleted while the process runs, only swept by the next [`initialize`]
/// when its count is zero. In-memory refs count live media entries; the
/// buffer and decoded values are cached only while that count is non-zero.
///
/// Every write and ref-count change for one blob id runs under that blob's
/// lock, so concurrent callers from different partitions never lose updates
/// and concurrent writers of the same content coalesce.
///
/// [`initialize`]: BlobStore::initialize
pub struct BlobStore {
    storage: Arc<dyn LocalStorage>,
    cache: Mutex<HashMap<BlobId, CachedBlob>>,
    locks: Mutex<HashMap<BlobId, Arc<tokio::sync::Mutex<()>>>>,
    live_index: OnceCell<Vec<BlobRow>>,
}

impl BlobStore {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            live_index: OnceCell::new(),
        }
    }

    async fn lock_blob(&self, blob_id: &BlobId) -> BlobGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock poisoned");
            Arc::clone(locks.entry(*blob_id).or_default())
        };
        BlobGuard {
            locks: &self.locks,
            blob_id: *blob_id,
            guard: Some(mutex.lock_owned().await),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<BlobId, CachedBlob>> {
        self.cache.lock().expect("lock poisoned")
    }

    /// Sweep unreferenced rows and return the live content index.
    ///
    /// Runs once per store; later calls return the same index.
    pub async fn initialize(&self) -> ScribeResult<Vec<BlobRow>> {
        let index = self
            .live_index
            .get_or_try_init(|| async {
                let rows = self
                    .storage
                    .list_blobs()
                    .await
                    .map_err(ScribeError::storage("list blobs"))?;
                let (dead, live): (Vec<BlobRow>, Vec<BlobRow>) =
                    rows.into_iter().partition(|row| row.persist_ref_count == 0);
                if !dead.is_empty() {
                    let mut batch = StorageBatch::new();
                    for row in &dead {
                        batch.delete_blob(row.blob_id);
                    }
                    self.storage
                        .commit(batch)
                        .await
                        .map_err(ScribeError::storage("sweep blobs"))?;
                    let mut cache = self.cache();
                    for row in &dead {
                        cache.remove(&row.blob_id);
                    }
                }
                info!(swept = dead.len(), live = live.len(), "blob store initialized");
                Ok::<_, ScribeError>(live)
            })
            .await?;
        Ok(index.clone())
    }

    /// Make sure a blob with the given length is stored, reading it with
    /// `read` only when no row exists yet.
    pub async fn precache<F, Fut>(
        &self,
        blob_id: BlobId,
        byte_length: u64,
        initial_ref_count: u64,
        read: F,
    ) -> ScribeResult<BlobRow>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ScribeResult<Bytes>> + Send,
    {
        let _guard = self.lock_blob(&blob_id).await;
        if let Some(row) = self.read_row(&blob_id).await? {
            if row.byte_length != byte_length {
                return Err(self.integrity(
                    &blob_id,
                    format!(
                        "precache of {blob_id} expected {byte_length} bytes, stored row has {}",
                        row.byte_length
                    ),
                ));
            }
            return Ok(row);
        }
        let content = read().await?;
        if content.len() as u64 != byte_length {
            return Err(self.integrity(
                &blob_id,
                format!(
                    "precache of {blob_id} expected {byte_length} bytes, read {}",
                    content.len()
                ),
            ));
        }
        self.write_new(blob_id, content, initial_ref_count).await
    }

    /// Cached buffer, else the stored one. Unknown ids read as `None`.
    pub async fn read(&self, blob_id: &BlobId) -> ScribeResult<Option<Bytes>> {
        if let Some(buffer) = self.cache().get(blob_id).and_then(|c| c.buffer.clone()) {
            return Ok(Some(buffer));
        }
        let buffer = self
            .storage
            .read_buffer(blob_id)
            .await
            .map_err(ScribeError::storage("read buffer"))?;
        if let Some(buffer) = &buffer {
            if let Some(cached) = self.cache().get_mut(blob_id) {
                if cached.in_memory_refs > 0 {
                    cached.buffer = Some(buffer.clone());
                }
            }
        }
        Ok(buffer)
    }

    /// Decode a blob, memoized per decoder while the blob is referenced.
    pub async fn decode(
        &self,
        blob_id: &BlobId,
        decoder: &dyn Decoder,
        ctx: &DecodeContext,
    ) -> ScribeResult<Option<Value>> {
        if let Some(value) = self
            .cache()
            .get(blob_id)
            .and_then(|c| c.decodings.get(decoder.name()).cloned())
        {
            return Ok(Some(value));
        }
        let Some(buffer) = self.read(blob_id).await? else {
            return Ok(None);
        };
        let value = decoder.decode(&buffer, ctx)?;
        if let Some(cached) = self.cache().get_mut(blob_id) {
            if cached.in_memory_refs > 0 {
                cached
                    .decodings
                    .insert(decoder.name().to_string(), value.clone());
            }
        }
        Ok(Some(value))
    }

    /// Store `buffer` under `blob_id`. Write-once: when a row already
    /// exists it is returned unchanged, keeping its persisted ref count.
    pub async fn persist(&self, buffer: Bytes, blob_id: BlobId, initial_ref_count: u64) -> ScribeResult<BlobRow> {
        if !blob_id.verify(&buffer) {
            return Err(self.integrity(
                &blob_id,
                format!("content does not hash to {blob_id}"),
            ));
        }
        let _guard = self.lock_blob(&blob_id).await;
        if let Some(row) = self.read_row(&blob_id).await? {
            self.fill_cache(&blob_id, &buffer);
            return Ok(row);
        }
        self.write_new(blob_id, buffer, initial_ref_count).await
    }

    /// [`persist`](Self::persist) with the id computed from the content.
    pub async fn persist_content(&self, buffer: Bytes, initial_ref_count: u64) -> ScribeResult<BlobRow> {
        let blob_id = BlobId::for_content(&buffer);
        self.persist(buffer, blob_id, initial_ref_count).await
    }

    /// Returns the new in-memory ref count.
    pub async fn add_in_memory_ref(&self, blob_id: &BlobId) -> ScribeResult<u64> {
        let _guard = self.lock_blob(blob_id).await;
        let first = {
            let mut cache = self.cache();
            let cached = cache.entry(*blob_id).or_default();
            cached.in_memory_refs += 1;
            cached.in_memory_refs == 1
        };
        if first {
            let buffer = self
                .storage
                .read_buffer(blob_id)
                .await
                .map_err(ScribeError::storage("read buffer"))?;
            if let Some(buffer) = buffer {
                self.fill_cache(blob_id, &buffer);
            }
        }
        Ok(self.cache().get(blob_id).map_or(0, |c| c.in_memory_refs))
    }

    /// Returns the new in-memory ref count. Dropping to zero evicts the
    /// buffer and every decoding.
    pub async fn remove_in_memory_ref(&self, blob_id: &BlobId) -> ScribeResult<u64> {
        let _guard = self.lock_blob(blob_id).await;
        let mut cache = self.cache();
        let Some(cached) = cache.get_mut(blob_id) else {
            return Ok(0);
        };
        cached.in_memory_refs = cached.in_memory_refs.saturating_sub(1);
        let remaining = cached.in_memory_refs;
        if remaining == 0 {
            cache.remove(blob_id);
            debug!(%blob_id, "evicted blob from memory");
        }
        Ok(remaining)
    }

    /// Increment the persisted ref count. `None` when the blob has no row.
    pub async fn add_persist_ref(&self, blob_id: &BlobId) -> ScribeResult<Option<u64>> {
        self.adjust_persist_ref(blob_id, |count| count + 1).await
    }

    /// Decrement the persisted ref count, clamped at zero. The row stays
    /// until the next sweep.
    pub async fn remove_persist_ref(&self, blob_id: &BlobId) -> ScribeResult<Option<u64>> {
        self.adjust_persist_ref(blob_id, |count| count.saturating_sub(1)).await
    }

    async fn adjust_persist_ref(&self, blob_id: &BlobId, adjust: impl FnOnce(u64) -> u64 + Send) -> ScribeResult<Option<u64>> {
        let _guard = self.lock_blob(blob_id).await;
        let Some(mut row) = self.read_row(blob_id).await? else {
            return Ok(None);
        };
        row.persist_ref_count = adjust(row.persist_ref_count);
        let mut batch = StorageBatch::new();
        batch.put_blob(row);
        self.storage
            .commit(batch)
            .await
            .map_err(ScribeError::storage("update blob ref count"))?;
        Ok(Some(row.persist_ref_count))
    }

    /// Whether the bytes of `blob_id` are available locally.
    pub async fn has_content(&self, blob_id: &BlobId) -> ScribeResult<bool> {
        if self.cache().get(blob_id).is_some_and(|c| c.buffer.is_some()) {
            return Ok(true);
        }
        Ok(self
            .storage
            .read_buffer(blob_id)
            .await
            .map_err(ScribeError::storage("read buffer"))?
            .is_some())
    }

    pub async fn blob_info(&self, blob_id: &BlobId) -> ScribeResult<Option<BlobInfo>> {
        let row = self.read_row(blob_id).await?;
        let cache = self.cache();
        let cached = cache.get(blob_id);
        if row.is_none() && cached.is_none() {
            return Ok(None);
        }
        Ok(Some(BlobInfo {
            blob_id: *blob_id,
            byte_length: row.map(|r| r.byte_length),
            persist_ref_count: row.map_or(0, |r| r.persist_ref_count),
            in_memory_ref_count: cached.map_or(0, |c| c.in_memory_refs),
            has_buffer: cached.is_some_and(|c| c.buffer.is_some()),
            decodings: cached.map_or(0, |c| c.decodings.len()),
        }))
    }

    async fn read_row(&self, blob_id: &BlobId) -> ScribeResult<Option<BlobRow>> {
        self.storage
            .read_blob(blob_id)
            .await
            .map_err(ScribeError::storage("read blob"))
    }

    async fn write_new(&self, blob_id: BlobId, buffer: Bytes, initial_ref_count: u64) -> ScribeResult<BlobRow> {
        let row = BlobRow {
            blob_id,
            byte_length: buffer.len() as u64,
            persist_ref_count: initial_ref_count,
        };
        let mut batch = StorageBatch::new();
        batch.put_buffer(blob_id, buffer.clone()).put_blob(row);
        self.storage
            .commit(batch)
            .await
            .map_err(ScribeError::storage("persist blob"))?;
        self.fill_cache(&blob_id, &buffer);
        debug!(%blob_id, bytes = row.byte_length, refs = initial_ref_count, "persisted blob");
        Ok(row)
    }

    /// Keep `buffer` in memory when the blob is referenced.
    fn fill_cache(&self, blob_id: &BlobId, buffer: &Bytes) {
        if let Some(cached) = self.cache().get_mut(blob_id) {
            if cached.in_memory_refs > 0 && cached.buffer.is_none() {
                cached.buffer = Some(buffer.clone());
            }
        }
    }

    fn integrity(&self, blob_id: &BlobId, reason: String) -> ScribeError {
        let state = match self.cache().get(blob_id) {
            Some(cached) => format!(
                "in_memory_refs={} has_buffer={} decodings={}",
                cached.in_memory_refs,
                cached.buffer.is_some(),
                cached.decodings.len()
            ),
            None => "not cached".to_string(),
        };
        ScribeError::StorageIntegrity {
            partition: "<blobs>".to_string(),
            reason,
            state,
        }
    }
}

/// Exclusive access to one blob id. Dropping the last holder removes the
/// lock from the map.
struct BlobGuard<'a> {
    locks: &'a Mutex<HashMap<BlobId, Arc<tokio::sync::Mutex<()>>>>,
    blob_id: BlobId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BlobGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mutex = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);
        let mut locks = self.locks.lock().expect("lock poisoned");
        // Held by the map and by `mutex` only: nobody else is waiting.
        let unshared = locks
            .get(&self.blob_id)
            .is_some_and(|held| Arc::ptr_eq(held, &mutex) && Arc::strong_count(&mutex) == 2);
        if unshared {
            locks.remove(&self.blob_id);
        }
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("cached", &self.cache().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vellum_authority::{JsonDecoder, TextDecoder};
    use vellum_store::{FileStorage, InMemoryStorage, JournalConfig};

    fn store() -> (Arc<InMemoryStorage>, BlobStore) {
        let storage = Arc::new(InMemoryStorage::new());
        let blobs = BlobStore::new(storage.clone());
        (storage, blobs)
    }

    #[tokio::test]
    async fn in_memory_refs_evict_buffer_and_decodings_but_keep_row() {
        let (_storage, blobs) = store();
        let content = Bytes::from_static(b"\"decoded\"");
        let row = blobs.persist_content(content.clone(), 1).await.unwrap();
        let blob_id = row.blob_id;

        const N: u64 = 5;
        for i in 1..=N {
            assert_eq!(blobs.add_in_memory_ref(&blob_id).await.unwrap(), i);
        }
        let ctx = DecodeContext::default();
        blobs.decode(&blob_id, &TextDecoder, &ctx).await.unwrap();
        blobs.decode(&blob_id, &JsonDecoder, &ctx).await.unwrap();
        let info = blobs.blob_info(&blob_id).await.unwrap().unwrap();
        assert!(info.has_buffer);
        assert_eq!(info.decodings, 2);

        for i in (0..N).rev() {
            assert_eq!(blobs.remove_in_memory_ref(&blob_id).await.unwrap(), i);
        }
        let info = blobs.blob_info(&blob_id).await.unwrap().unwrap();
        assert!(!info.has_buffer);
        assert_eq!(info.decodings, 0);
        assert_eq!(info.in_memory_ref_count, 0);
        assert_eq!(info.persist_ref_count, 1);
        assert_eq!(blobs.read(&blob_id).await.unwrap(), Some(content));
    }

    #[tokio::test]
    async fn existing_row_ref_count_wins() {
        let (_storage, blobs) = store();
        let content = Bytes::from_static(b"shared");
        blobs.persist_content(content.clone(), 3).await.unwrap();
        let row = blobs.persist_content(content, 7).await.unwrap();
        assert_eq!(row.persist_ref_count, 3);
    }

    #[tokio::test]
    async fn concurrent_persists_coalesce() {
        let (storage, blobs) = store();
        let blobs = Arc::new(blobs);
        let content = Bytes::from_static(b"raced");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let blobs = Arc::clone(&blobs);
                let content = content.clone();
                tokio::spawn(async move { blobs.persist_content(content, i + 1).await })
            })
            .collect();
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().unwrap().persist_ref_count);
        }
        counts.dedup();
        assert_eq!(counts.len(), 1);
        assert_eq!(storage.blob_count().await, 1);
    }

    #[tokio::test]
    async fn persist_rejects_mismatched_hash() {
        let (_storage, blobs) = store();
        let wrong = BlobId::for_content(b"other");
        let err = blobs
            .persist(Bytes::from_static(b"content"), wrong, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::StorageIntegrity { .. }));
    }

    #[tokio::test]
    async fn persist_refs_clamp_at_zero_without_deleting() {
        let (_storage, blobs) = store();
        let row = blobs.persist_content(Bytes::from_static(b"x"), 1).await.unwrap();
        assert_eq!(blobs.remove_persist_ref(&row.blob_id).await.unwrap(), Some(0));
        assert_eq!(blobs.remove_persist_ref(&row.blob_id).await.unwrap(), Some(0));
        assert!(blobs.has_content(&row.blob_id).await.unwrap());
        assert_eq!(blobs.add_persist_ref(&row.blob_id).await.unwrap(), Some(1));

        let unknown = BlobId::for_content(b"unknown");
        assert_eq!(blobs.add_persist_ref(&unknown).await.unwrap(), None);
        assert_eq!(blobs.read(&unknown).await.unwrap(), None);
    }

    #[tokio::test]
    async fn precache_reads_once_and_validates_length() {
        let (_storage, blobs) = store();
        let content = Bytes::from_static(b"precached");
        let blob_id = BlobId::for_content(&content);
        let reads = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let reads = Arc::clone(&reads);
            let content = content.clone();
            blobs
                .precache(blob_id, content.len() as u64, 1, move || async move {
                    reads.fetch_add(1, Ordering::SeqCst);
                    Ok(content)
                })
                .await
                .unwrap();
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let err = blobs
            .precache(blob_id, 3, 1, || async { Ok(Bytes::new()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::StorageIntegrity { .. }));
    }

    #[tokio::test]
    async fn sweep_on_reopen_removes_unreferenced_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.journal");
        let (kept, dropped) = {
            let storage = Arc::new(FileStorage::open(&path, JournalConfig::default()).unwrap());
            let blobs = BlobStore::new(storage);
            assert!(blobs.initialize().await.unwrap().is_empty());
            let kept = blobs.persist_content(Bytes::from_static(b"kept"), 1).await.unwrap();
            let dropped = blobs.persist_content(Bytes::from_static(b"dropped"), 1).await.unwrap();
            blobs.remove_persist_ref(&dropped.blob_id).await.unwrap();
            // Still present until the next initialize.
            assert!(blobs.has_content(&dropped.blob_id).await.unwrap());
            (kept.blob_id, dropped.blob_id)
        };

        let storage = Arc::new(FileStorage::open(&path, JournalConfig::default()).unwrap());
        let blobs = BlobStore::new(storage);
        let live = blobs.initialize().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].blob_id, kept);
        assert!(!blobs.has_content(&dropped).await.unwrap());
        assert_eq!(blobs.blob_info(&dropped).await.unwrap(), None);
        // Idempotent.
        assert_eq!(blobs.initialize().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ref_changes_are_not_lost() {
        let (_storage, blobs) = store();
        let blobs = Arc::new(blobs);
        let blob_id = blobs.persist_content(Bytes::from_static(b"contended"), 1).await.unwrap().blob_id;

        const N: usize = 32;
        let adds: Vec<_> = (0..N)
            .map(|_| {
                let blobs = Arc::clone(&blobs);
                tokio::spawn(async move {
                    blobs.add_persist_ref(&blob_id).await.unwrap();
                    blobs.add_in_memory_ref(&blob_id).await.unwrap();
                })
            })
            .collect();
        for handle in adds {
            handle.await.unwrap();
        }
        let info = blobs.blob_info(&blob_id).await.unwrap().unwrap();
        assert_eq!(info.persist_ref_count, 1 + N as u64);
        assert_eq!(info.in_memory_ref_count, N as u64);
        assert!(info.has_buffer);

        let removes: Vec<_> = (0..N)
            .map(|_| {
                let blobs = Arc::clone(&blobs);
                tokio::spawn(async move {
                    blobs.remove_in_memory_ref(&blob_id).await.unwrap();
                    blobs.remove_persist_ref(&blob_id).await.unwrap();
                })
            })
            .collect();
        for handle in removes {
            handle.await.unwrap();
        }
        let info = blobs.blob_info(&blob_id).await.unwrap().unwrap();
        assert_eq!(info.persist_ref_count, 1);
        assert_eq!(info.in_memory_ref_count, 0);
        assert!(!info.has_buffer);
        assert!(blobs.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blob_locks_are_dropped_after_use() {
        let (_storage, blobs) = store();
        for content in [b"a", b"b", b"c"] {
            let row = blobs.persist_content(Bytes::copy_from_slice(content), 1).await.unwrap();
            blobs.add_in_memory_ref(&row.blob_id).await.unwrap();
            blobs.remove_persist_ref(&row.blob_id).await.unwrap();
        }
        assert!(blobs.locks.lock().unwrap().is_empty());
    }
}
