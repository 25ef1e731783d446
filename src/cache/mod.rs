//! Single-flight, LRU-pruned file cache backing both the item and artwork
//! caches.

pub mod stream;

use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use memmap2::Mmap;
use tokio::fs::File as TokioFile;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, Notify};

/// Cache entries are keyed by the owning item/container row id.
pub type CacheKey = i64;

const READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(std::io::Error),

    #[error("reading from the remote origin failed: {0}")]
    RemoteUnavailable(std::io::Error),

    #[error("waiting for cache entry {0} to become ready timed out")]
    BusyTimeout(CacheKey),

    #[error("cache entry {0} failed to download and cannot be served")]
    DownloadFailed(CacheKey),
}

/// Whether a `FileCache` stores whole-track payloads (memory-mapped on load)
/// or artwork payloads (plain file handle on load).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Item,
    Artwork,
}

impl CacheKind {
    fn label(self) -> &'static str {
        match self {
            CacheKind::Item => "item cache",
            CacheKind::Artwork => "artwork cache",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    /// On disk (from a previous run or a just-expired entry) but nothing is
    /// mapped into memory yet: safe to lazily load, never to fetch remotely.
    Idle,
    /// A download or lazy load is in flight; other callers must wait on
    /// `ready`.
    Pending,
    /// An in-memory reader is installed and the entry can be streamed.
    Ready,
    /// The in-flight download failed; waiters should surface an error. The
    /// entry is removed from the index as soon as the last waiter observes
    /// this state, so the next `get` starts a fresh attempt.
    Failed,
}

enum CacheEntryData {
    Unloaded,
    File(Arc<Mutex<TokioFile>>),
    Mmap(Arc<Mmap>),
}

pub struct CacheEntry {
    state: std::sync::Mutex<ReadyState>,
    ready: Notify,
    data: Mutex<CacheEntryData>,
    uses: AtomicU32,
    size: AtomicU64,
    permanent: AtomicBool,
}

impl CacheEntry {
    fn new(permanent: bool) -> Self {
        Self {
            state: std::sync::Mutex::new(ReadyState::Pending),
            ready: Notify::new(),
            data: Mutex::new(CacheEntryData::Unloaded),
            uses: AtomicU32::new(0),
            size: AtomicU64::new(0),
            permanent: AtomicBool::new(permanent),
        }
    }

    fn from_disk(permanent: bool, size: u64) -> Self {
        let entry = Self::new(permanent);
        *entry.state.lock().unwrap() = ReadyState::Idle;
        entry.size.store(size, Ordering::SeqCst);
        entry
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent.load(Ordering::SeqCst)
    }

    fn mark_ready(&self) {
        *self.state.lock().unwrap() = ReadyState::Ready;
        self.ready.notify_waiters();
    }

    fn mark_idle(&self) {
        *self.state.lock().unwrap() = ReadyState::Idle;
    }

    fn mark_failed(&self) {
        *self.state.lock().unwrap() = ReadyState::Failed;
        self.ready.notify_waiters();
    }

    fn state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }
}

/// What a caller must do with the entry `get` handed back.
pub enum GetOutcome {
    /// Bytes are available (possibly lazily, via `stream`) without touching
    /// the remote origin.
    Ready(Arc<CacheEntry>),
    /// Nothing is on disk for this key; the caller must fetch a reader from
    /// the origin and hand it to `download`.
    NeedsDownload(Arc<CacheEntry>),
}

#[derive(Debug)]
pub struct CleanReport {
    pub expired: usize,
    pub evicted: usize,
}

/// A single-flight, checksum-free byte cache: at most one remote fetch is ever
/// in flight per key, readers of an in-progress download block on a
/// completion event (bounded by `READY_TIMEOUT`), and eviction only ever
/// touches entries nobody currently holds open.
pub struct FileCache {
    kind: CacheKind,
    dir: PathBuf,
    max_size: u64,
    prune_threshold: f64,
    chunk_size: usize,
    entries: Mutex<IndexMap<CacheKey, Arc<CacheEntry>>>,
    prune_lock: Mutex<()>,
    permanent_keys: Mutex<HashSet<CacheKey>>,
    current_size: AtomicU64,
}

impl FileCache {
    pub fn new(
        kind: CacheKind,
        dir: impl Into<PathBuf>,
        max_size_bytes: u64,
        prune_threshold: f64,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(CacheError::Io)?;

        Ok(Self {
            kind,
            dir,
            max_size: max_size_bytes,
            prune_threshold,
            chunk_size: stream::DEFAULT_CHUNK_SIZE,
            entries: Mutex::new(IndexMap::new()),
            prune_lock: Mutex::new(()),
            permanent_keys: Mutex::new(HashSet::new()),
            current_size: AtomicU64::new(0),
        })
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::SeqCst)
    }

    fn label(&self) -> &'static str {
        self.kind.label()
    }

    fn path_for(&self, key: CacheKey) -> PathBuf {
        self.dir.join(key.to_string())
    }

    /// Walks the cache directory, registering every on-disk file as an idle
    /// entry. Files whose names don't parse as a cache key are logged and
    /// skipped, matching an operator dropping stray files into the directory.
    pub async fn index(&self, permanent_keys: &HashSet<CacheKey>) -> Result<(), CacheError> {
        *self.permanent_keys.lock().await = permanent_keys.clone();

        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(CacheError::Io)?;
        let mut entries = self.entries.lock().await;
        let mut added_size: u64 = 0;

        while let Some(dirent) = dir.next_entry().await.map_err(CacheError::Io)? {
            let file_name = dirent.file_name();
            let name = file_name.to_string_lossy();
            if name.ends_with(".temp") {
                continue;
            }

            let key: CacheKey = match name.parse() {
                Ok(key) => key,
                Err(_) => {
                    log::warn!("{}: unexpected entry in cache directory: {name}", self.label());
                    continue;
                }
            };

            if entries.contains_key(&key) {
                continue;
            }

            let metadata = dirent.metadata().await.map_err(CacheError::Io)?;
            let permanent = permanent_keys.contains(&key);
            if !permanent {
                added_size += metadata.len();
            }
            entries.insert(key, Arc::new(CacheEntry::from_disk(permanent, metadata.len())));
        }

        drop(entries);
        self.current_size.fetch_add(added_size, Ordering::SeqCst);
        Ok(())
    }

    pub async fn contains(&self, key: CacheKey) -> bool {
        self.entries.lock().await.contains_key(&key)
    }

    /// Reserves `key`'s slot, moving it to the most-recently-used position.
    /// Returns immediately for a brand new key (the caller becomes the
    /// loader); blocks up to `READY_TIMEOUT` for a key whose download is
    /// already in flight.
    pub async fn get(&self, key: CacheKey) -> Result<GetOutcome, CacheError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.shift_remove(&key) {
            entries.insert(key, Arc::clone(&entry));
            drop(entries);

            let notified = entry.ready.notified();
            match entry.state() {
                ReadyState::Ready => Ok(GetOutcome::Ready(entry)),
                ReadyState::Idle => {
                    self.load(key, &entry).await?;
                    Ok(GetOutcome::Ready(entry))
                }
                ReadyState::Failed => Err(CacheError::DownloadFailed(key)),
                ReadyState::Pending => {
                    tokio::time::timeout(READY_TIMEOUT, notified)
                        .await
                        .map_err(|_| CacheError::BusyTimeout(key))?;

                    match entry.state() {
                        ReadyState::Ready => Ok(GetOutcome::Ready(entry)),
                        _ => {
                            self.forget_if_current(key, &entry).await;
                            Err(CacheError::DownloadFailed(key))
                        }
                    }
                }
            }
        } else {
            let permanent = self.permanent_keys.lock().await.contains(&key);
            let entry = Arc::new(CacheEntry::new(permanent));
            entries.insert(key, Arc::clone(&entry));
            Ok(GetOutcome::NeedsDownload(entry))
        }
    }

    /// Starts a single-flight remote download for a reserved, brand new
    /// entry. The returned stream yields bytes as they arrive; the full
    /// payload is always written to disk regardless of whether the stream is
    /// read to completion (see `cache::stream`).
    pub fn download<R>(
        self: &Arc<Self>,
        key: CacheKey,
        entry: Arc<CacheEntry>,
        remote: R,
        range: Option<Range<u64>>,
    ) -> BoxStream<'static, Result<Bytes, CacheError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let target_path = self.path_for(key);
        let this_for_cache = Arc::clone(self);
        let entry_for_cache = Arc::clone(&entry);
        let this_for_error = Arc::clone(self);
        let entry_for_error = entry;

        stream::stream_from_remote(
            remote,
            target_path,
            range,
            self.chunk_size,
            move |_size| {
                tokio::spawn(async move {
                    if let Err(err) = this_for_cache.load(key, &entry_for_cache).await {
                        log::error!(
                            "{}: failed to install entry {key} after download: {err}",
                            this_for_cache.label()
                        );
                        this_for_cache.forget_if_current(key, &entry_for_cache).await;
                        entry_for_cache.mark_failed();
                    }
                });
            },
            move || {
                tokio::spawn(async move {
                    this_for_error.forget_if_current(key, &entry_for_error).await;
                    entry_for_error.mark_failed();
                });
            },
        )
    }

    /// Installs an in-memory reader for an on-disk file: a memory map for
    /// item payloads, a plain file handle for artwork.
    async fn load(&self, key: CacheKey, entry: &Arc<CacheEntry>) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path).await.map_err(CacheError::Io)?;
        let file_size = metadata.len();

        let new_data = match self.kind {
            CacheKind::Item => {
                let std_file = std::fs::File::open(&path).map_err(CacheError::Io)?;
                let mmap = unsafe { Mmap::map(&std_file) }.map_err(CacheError::Io)?;
                CacheEntryData::Mmap(Arc::new(mmap))
            }
            CacheKind::Artwork => {
                let file = TokioFile::open(&path).await.map_err(CacheError::Io)?;
                CacheEntryData::File(Arc::new(Mutex::new(file)))
            }
        };

        {
            let mut data = entry.data.lock().await;
            *data = new_data;
        }

        self.account_size_change(entry, file_size);
        entry.mark_ready();
        Ok(())
    }

    /// Closes the in-memory reader but keeps size/permanence bookkeeping.
    /// Used by `clean`'s expire phase and by the Cache Manager's prefetch pass
    /// once a download has been drained to disk.
    pub async fn unload(&self, entry: &Arc<CacheEntry>) {
        let mut data = entry.data.lock().await;
        *data = CacheEntryData::Unloaded;
    }

    fn account_size_change(&self, entry: &Arc<CacheEntry>, new_size: u64) {
        let old_size = entry.size.swap(new_size, Ordering::SeqCst);
        if entry.is_permanent() {
            return;
        }
        if new_size >= old_size {
            self.current_size.fetch_add(new_size - old_size, Ordering::SeqCst);
        } else {
            self.current_size.fetch_sub(old_size - new_size, Ordering::SeqCst);
        }
    }

    async fn forget_if_current(&self, key: CacheKey, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&key) {
            if Arc::ptr_eq(existing, entry) {
                entries.shift_remove(&key);
            }
        }
    }

    /// Lazily loads (if needed) and returns a byte-range stream over a ready
    /// entry. Bumps the entry's use count for the stream's lifetime so
    /// `clean` leaves it alone until the last reader finishes.
    pub async fn stream(
        &self,
        key: CacheKey,
        entry: &Arc<CacheEntry>,
        range: Option<Range<u64>>,
    ) -> Result<BoxStream<'static, Result<Bytes, CacheError>>, CacheError> {
        let needs_load = matches!(&*entry.data.lock().await, CacheEntryData::Unloaded);
        if needs_load {
            self.load(key, entry).await?;
        }

        let size = entry.size();
        let data = entry.data.lock().await;

        let entry_start = Arc::clone(entry);
        let entry_finish = Arc::clone(entry);
        let on_start = move || {
            entry_start.uses.fetch_add(1, Ordering::SeqCst);
        };
        let on_finish = move || {
            entry_finish.uses.fetch_sub(1, Ordering::SeqCst);
        };

        match &*data {
            CacheEntryData::Mmap(mmap) => Ok(stream::stream_from_buffer(
                Arc::clone(mmap),
                size,
                range,
                self.chunk_size,
                on_start,
                on_finish,
            )),
            CacheEntryData::File(file) => Ok(stream::stream_from_file(
                Arc::clone(file),
                size,
                range,
                on_start,
                on_finish,
            )),
            CacheEntryData::Unloaded => unreachable!("load() just installed data"),
        }
    }

    /// Two-phase housekeeping pass: first expire unused ready entries back to
    /// idle (closing handles, keeping metadata), then, only if over budget
    /// or `force`, evict idle, non-permanent entries oldest first until back
    /// under the prune threshold.
    pub async fn clean(&self, force: bool) -> CleanReport {
        let mut expired = Vec::new();
        {
            let entries = self.entries.lock().await;
            for (key, entry) in entries.iter() {
                if entry.uses.load(Ordering::SeqCst) == 0 && entry.state() == ReadyState::Ready {
                    expired.push((*key, Arc::clone(entry)));
                }
            }
        }
        for (_, entry) in &expired {
            self.unload(entry).await;
            entry.mark_idle();
        }

        let _prune_guard = self.prune_lock.lock().await;
        let mut evicted = Vec::new();

        let should_prune =
            force || (self.max_size > 0 && self.current_size.load(Ordering::SeqCst) >= self.max_size);

        if should_prune {
            let low_water_mark = (self.max_size as f64 * (1.0 - self.prune_threshold)) as u64;
            let mut entries = self.entries.lock().await;
            let keys_in_order: Vec<CacheKey> = entries.keys().copied().collect();

            for key in keys_in_order {
                if !force && self.current_size.load(Ordering::SeqCst) <= low_water_mark {
                    break;
                }

                let Some(entry) = entries.get(&key).cloned() else {
                    continue;
                };
                if entry.is_permanent() || entry.uses.load(Ordering::SeqCst) != 0 {
                    continue;
                }
                if entry.state() != ReadyState::Idle {
                    continue;
                }

                entries.shift_remove(&key);
                self.current_size.fetch_sub(entry.size(), Ordering::SeqCst);
                evicted.push((key, entry));
            }
        }

        for (key, _) in &evicted {
            if let Err(err) = tokio::fs::remove_file(self.path_for(*key)).await {
                log::warn!("{}: failed to unlink evicted entry {key}: {err}", self.label());
            }
        }

        CleanReport {
            expired: expired.len(),
            evicted: evicted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cache(kind: CacheKind, dir: &std::path::Path) -> Arc<FileCache> {
        Arc::new(FileCache::new(kind, dir, 1024 * 1024, 0.2).unwrap())
    }

    #[tokio::test]
    async fn fresh_key_requires_download_and_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(CacheKind::Artwork, dir.path());

        let entry = match cache.get(1).await.unwrap() {
            GetOutcome::NeedsDownload(entry) => entry,
            GetOutcome::Ready(_) => panic!("expected a fresh key to need a download"),
        };

        let remote = crate::subsonic::bytes_reader(Bytes::from_static(b"hello world"));
        let mut stream = cache.download(1, entry, remote, None);
        use futures::StreamExt;
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");

        // Give the on_cache callback's spawned load() a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        match cache.get(1).await.unwrap() {
            GetOutcome::Ready(entry) => assert_eq!(entry.size(), 11),
            GetOutcome::NeedsDownload(_) => panic!("expected the entry to be ready by now"),
        }
    }

    #[tokio::test]
    async fn concurrent_waiters_share_a_single_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(CacheKind::Item, dir.path());

        let entry = match cache.get(7).await.unwrap() {
            GetOutcome::NeedsDownload(entry) => entry,
            GetOutcome::Ready(_) => unreachable!(),
        };

        let waiter_cache = Arc::clone(&cache);
        let waiter = tokio::spawn(async move { waiter_cache.get(7).await });

        let remote = crate::subsonic::bytes_reader(Bytes::from(vec![b'X'; 4096]));
        let mut stream = cache.download(7, entry, remote, None);
        use futures::StreamExt;
        while stream.next().await.is_some() {}

        let outcome = waiter.await.unwrap().unwrap();
        match outcome {
            GetOutcome::Ready(entry) => assert_eq!(entry.size(), 4096),
            GetOutcome::NeedsDownload(_) => panic!("waiter should have observed the in-flight download"),
        }
    }

    #[tokio::test]
    async fn index_registers_on_disk_files_as_idle() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("99"), b"cached bytes").await.unwrap();

        let cache = new_cache(CacheKind::Artwork, dir.path());
        cache.index(&HashSet::new()).await.unwrap();
        assert!(cache.contains(99).await);

        match cache.get(99).await.unwrap() {
            GetOutcome::Ready(entry) => assert_eq!(entry.size(), 12),
            GetOutcome::NeedsDownload(_) => panic!("an indexed file must not require a download"),
        }
    }

    #[tokio::test]
    async fn clean_evicts_idle_entries_over_budget_and_spares_permanent_ones() {
        let dir = tempfile::tempdir().unwrap();
        for key in [1, 2, 3] {
            tokio::fs::write(dir.path().join(key.to_string()), vec![b'x'; 100])
                .await
                .unwrap();
        }

        let cache = Arc::new(FileCache::new(CacheKind::Artwork, dir.path(), 150, 0.5).unwrap());
        let mut permanent = HashSet::new();
        permanent.insert(1);
        cache.index(&permanent).await.unwrap();

        // Load every entry (lazily) then let `clean`'s expire phase idle them.
        for key in [1, 2, 3] {
            cache.get(key).await.unwrap();
        }

        let report = cache.clean(false).await;
        assert!(report.evicted >= 1);
        assert!(dir.path().join("1").exists(), "permanent entry must survive eviction");
    }
}
