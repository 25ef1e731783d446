//! DAAP-facing facade resolving a catalog item/artwork to a byte stream,
//! backed by the File Cache and falling back to the Subsonic Client on a
//! miss.

use std::collections::HashMap;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;

use crate::cache::{CacheError, FileCache, GetOutcome};
use crate::catalog::entities::Item;
use crate::subsonic::{Client, SubsonicError, TranscodePolicy};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("remote origin error: {0}")]
    Remote(#[from] SubsonicError),

    #[error("no subsonic connection configured for database {0}")]
    UnknownOrigin(i64),
}

/// One level's worth of additions/removals from a single synchronizer pass.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet<T> {
    pub inserted_or_updated: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.inserted_or_updated.is_empty() && self.removed.is_empty()
    }
}

/// Everything a single synchronizer pass changed, handed to the Provider via
/// `apply_sync` and rebroadcast to external subscribers.
#[derive(Debug, Clone, Default)]
pub struct SyncIntents {
    pub items: ChangeSet<i64>,
    pub base_container_items: ChangeSet<i64>,
    pub containers: ChangeSet<i64>,
    pub container_items: ChangeSet<i64>,
}

impl SyncIntents {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.base_container_items.is_empty()
            && self.containers.is_empty()
            && self.container_items.is_empty()
    }
}

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// The DAAP-facing facade: resolves items and artwork to byte streams, and
/// republishes synchronizer changesets to whatever external layer renders
/// the DAAP wire protocol.
pub struct Provider {
    item_cache: Arc<FileCache>,
    artwork_cache: Arc<FileCache>,
    clients: std::sync::RwLock<HashMap<i64, Arc<Client>>>,
    policies: std::sync::RwLock<HashMap<i64, TranscodePolicy>>,
    revision: AtomicU64,
    sync_tx: broadcast::Sender<SyncIntents>,
}

impl Provider {
    pub fn new(item_cache: Arc<FileCache>, artwork_cache: Arc<FileCache>) -> Self {
        let (sync_tx, _) = broadcast::channel(16);
        Self {
            item_cache,
            artwork_cache,
            clients: std::sync::RwLock::new(HashMap::new()),
            policies: std::sync::RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
            sync_tx,
        }
    }

    /// Registers the Subsonic client and transcode policy for a database's
    /// origin. Must be called once per origin before that database's items
    /// are ever resolved. Takes `&self` (backed by an `RwLock`) rather than
    /// `&mut self` because a database's id is only known once its
    /// Synchronizer (which itself holds an `Arc<Provider>`) has upserted
    /// the `database` row, so registration necessarily happens after the
    /// Provider is shared.
    pub fn register_origin(&self, database_id: i64, client: Arc<Client>, policy: TranscodePolicy) {
        self.clients.write().unwrap().insert(database_id, client);
        self.policies.write().unwrap().insert(database_id, policy);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn subscribe_to_sync(&self) -> broadcast::Receiver<SyncIntents> {
        self.sync_tx.subscribe()
    }

    /// Bumps the revision counter and rebroadcasts `intents` iff anything
    /// actually changed; a no-op pass (e.g. the cheap-skip in step 1) must
    /// not disturb subscribers or the revision counter.
    pub fn apply_sync(&self, intents: SyncIntents) {
        if intents.is_empty() {
            return;
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
        let _ = self.sync_tx.send(intents);
    }

    /// `All` always transcodes; `Unsupported` transcodes iff the item's file
    /// suffix is in the policy's unsupported set; `No` never transcodes.
    pub fn decide_transcode(item: &Item, policy: &TranscodePolicy) -> Option<&'static str> {
        policy.decide(&item.file_suffix)
    }

    pub async fn get_item_data(
        &self,
        item: &Item,
        range: Option<Range<u64>>,
    ) -> Result<(BoxStream<'static, Result<Bytes, ProviderError>>, String, i64), ProviderError> {
        match self.item_cache.get(item.id).await? {
            GetOutcome::Ready(entry) => {
                let size = entry.size() as i64;
                let stream = self.item_cache.stream(item.id, &entry, range).await?;
                Ok((map_stream(stream), self.effective_mime(item), size))
            }
            GetOutcome::NeedsDownload(entry) => {
                let client = self.client_for(item.database_id)?;
                let transcode = self.transcode_for(item);

                let (reader, mime, size): (BoxedReader, String, i64) = match transcode {
                    Some(format) => {
                        let reader = client.stream(item.remote_id as u64, format).await?;
                        (Box::pin(reader), "audio/mpeg".to_string(), -1)
                    }
                    None => {
                        let reader = client.download(item.remote_id as u64).await?;
                        (Box::pin(reader), item.mime_type().to_string(), item.file_size)
                    }
                };

                let stream = self.item_cache.download(item.id, entry, reader, range);
                Ok((map_stream(stream), mime, size))
            }
        }
    }

    /// The transcode decision for an item under its origin's registered
    /// policy. Called on both the miss path (to pick a download format) and
    /// the cache-hit path (to report the MIME the cached bytes actually are),
    /// since the policy is fixed per origin and the decision is otherwise the
    /// same deterministic function of `(item, policy)` either time.
    fn transcode_for(&self, item: &Item) -> Option<&'static str> {
        self.policies
            .read()
            .unwrap()
            .get(&item.database_id)
            .and_then(|policy| Self::decide_transcode(item, policy))
    }

    /// The MIME type a served item actually has on disk: `audio/mpeg` if it
    /// was transcoded, the suffix-derived type otherwise. Must agree with
    /// whatever `get_item_data`'s miss path wrote to the cache, since a
    /// cache hit serves whatever bytes are already there regardless of the
    /// item's own `file_suffix`.
    fn effective_mime(&self, item: &Item) -> String {
        match self.transcode_for(item) {
            Some(_) => "audio/mpeg".to_string(),
            None => item.mime_type().to_string(),
        }
    }

    pub async fn get_artwork_data(
        &self,
        item: &Item,
    ) -> Result<(BoxStream<'static, Result<Bytes, ProviderError>>, String, i64), ProviderError> {
        match self.artwork_cache.get(item.id).await? {
            GetOutcome::Ready(entry) => {
                let size = entry.size() as i64;
                let stream = self.artwork_cache.stream(item.id, &entry, None).await?;
                Ok((map_stream(stream), "image/jpeg".to_string(), size))
            }
            GetOutcome::NeedsDownload(entry) => {
                let client = self.client_for(item.database_id)?;
                let reader = client.cover_art(item.remote_id as u64).await?;
                let boxed: BoxedReader = Box::pin(reader);
                let stream = self.artwork_cache.download(item.id, entry, boxed, None);
                Ok((map_stream(stream), "image/jpeg".to_string(), -1))
            }
        }
    }

    fn client_for(&self, database_id: i64) -> Result<Arc<Client>, ProviderError> {
        self.clients
            .read()
            .unwrap()
            .get(&database_id)
            .cloned()
            .ok_or(ProviderError::UnknownOrigin(database_id))
    }
}

fn map_stream(
    stream: BoxStream<'static, Result<Bytes, CacheError>>,
) -> BoxStream<'static, Result<Bytes, ProviderError>> {
    stream.map(|r| r.map_err(ProviderError::from)).boxed()
}
