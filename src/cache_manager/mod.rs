//! Keeps the on-disk File Caches in sync with the catalog's permanently
//! pinned set (`cache = 1 AND exclude = 0`) and runs their periodic
//! housekeeping passes.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;

use crate::cache::{CacheError, CacheKey, FileCache, GetOutcome};
use crate::catalog::entities::Item;
use crate::catalog::items::ItemsRepository;
use crate::catalog::{CatalogError, CatalogStore};
use crate::subsonic::{Client, SubsonicError};

#[derive(Debug, thiserror::Error)]
pub enum CacheManagerError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("remote origin error: {0}")]
    Remote(#[from] SubsonicError),

    #[error("no subsonic connection configured for database {0}")]
    UnknownOrigin(i64),
}

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Drives both `FileCache` instances: keeps their permanent-key set aligned
/// with the catalog, prefetches anything pinned but not yet on disk, and runs
/// their periodic expire/clean passes.
pub struct CacheManager {
    item_cache: Arc<FileCache>,
    artwork_cache: Arc<FileCache>,
    catalog: Arc<CatalogStore>,
    clients: HashMap<i64, Arc<Client>>,
    items: ItemsRepository,
}

impl CacheManager {
    pub fn new(
        item_cache: Arc<FileCache>,
        artwork_cache: Arc<FileCache>,
        catalog: Arc<CatalogStore>,
        clients: HashMap<i64, Arc<Client>>,
    ) -> Self {
        Self {
            item_cache,
            artwork_cache,
            catalog,
            clients,
            items: ItemsRepository::new(),
        }
    }

    /// Re-indexes both caches against the catalog's permanently-pinned item
    /// set, then prefetches artwork and item payloads for any pinned id not
    /// already on disk. A single item's prefetch failure is logged and does
    /// not abort the pass.
    pub async fn cache(&self) -> Result<(), CacheManagerError> {
        let items = self.items.permanently_cached(self.catalog.pool()).await?;
        let pinned: HashSet<CacheKey> = items.iter().map(|item| item.id).collect();

        self.item_cache.index(&pinned).await?;
        self.artwork_cache.index(&pinned).await?;

        for item in &items {
            if !self.artwork_cache.contains(item.id).await {
                if let Err(err) = self.prefetch_artwork(item).await {
                    log::warn!("cache manager: failed to prefetch artwork for item {}: {err}", item.id);
                }
            }

            if !self.item_cache.contains(item.id).await {
                if let Err(err) = self.prefetch_item(item).await {
                    log::warn!("cache manager: failed to prefetch item {}: {err}", item.id);
                }
            }
        }

        Ok(())
    }

    async fn prefetch_artwork(&self, item: &Item) -> Result<(), CacheManagerError> {
        let entry = match self.artwork_cache.get(item.id).await? {
            GetOutcome::Ready(_) => return Ok(()),
            GetOutcome::NeedsDownload(entry) => entry,
        };

        let client = self.client_for(item.database_id)?;
        let reader = client.cover_art(item.remote_id as u64).await?;
        let boxed: BoxedReader = Box::pin(reader);

        let mut stream = self.artwork_cache.download(item.id, Arc::clone(&entry), boxed, None);
        while stream.next().await.is_some() {}
        self.artwork_cache.unload(&entry).await;

        Ok(())
    }

    async fn prefetch_item(&self, item: &Item) -> Result<(), CacheManagerError> {
        let entry = match self.item_cache.get(item.id).await? {
            GetOutcome::Ready(_) => return Ok(()),
            GetOutcome::NeedsDownload(entry) => entry,
        };

        let client = self.client_for(item.database_id)?;
        let reader = client.download(item.remote_id as u64).await?;
        let boxed: BoxedReader = Box::pin(reader);

        let mut stream = self.item_cache.download(item.id, Arc::clone(&entry), boxed, None);
        while stream.next().await.is_some() {}
        self.item_cache.unload(&entry).await;

        Ok(())
    }

    /// Unloads unused ready entries back to idle; run every 5 minutes.
    pub async fn expire(&self) -> Result<(), CacheManagerError> {
        let item_report = self.item_cache.clean(false).await;
        let artwork_report = self.artwork_cache.clean(false).await;
        log::debug!(
            "cache manager: expire pass, item={item_report:?} artwork={artwork_report:?}"
        );
        Ok(())
    }

    /// Evicts idle, non-permanent entries over budget; run every 30 minutes.
    /// `force` bypasses the size budget check and is reserved for an explicit
    /// admin-triggered call outside this crate's periodic schedule.
    pub async fn clean(&self, force: bool) -> Result<(), CacheManagerError> {
        let item_report = self.item_cache.clean(force).await;
        let artwork_report = self.artwork_cache.clean(force).await;
        log::info!(
            "cache manager: clean pass (force={force}), item={item_report:?} artwork={artwork_report:?}"
        );
        Ok(())
    }

    fn client_for(&self, database_id: i64) -> Result<&Arc<Client>, CacheManagerError> {
        self.clients
            .get(&database_id)
            .ok_or(CacheManagerError::UnknownOrigin(database_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKind;
    use crate::config::{OriginConfig, SynchronizationMode, TranscodeMode};
    use httpmock::prelude::*;

    fn origin_config(base_url: &str) -> OriginConfig {
        OriginConfig {
            url: base_url.to_string(),
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            synchronization: SynchronizationMode::Manual,
            synchronization_interval_minutes: None,
            transcode: TranscodeMode::No,
            transcode_unsupported: Default::default(),
        }
    }

    async fn seed_pinned_item(catalog: &CatalogStore, remote_id: i64) -> i64 {
        sqlx::query(
            "INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id) VALUES (1, 'db', 0, 0, 1)",
        )
        .execute(catalog.pool())
        .await
        .unwrap();

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO item (persistent_id, database_id, name, duration, file_name, file_type, \
             file_suffix, file_size, exclude, cache, checksum, remote_id) \
             VALUES (1, 1, 'Track', 1000, 'track.mp3', 'audio/mpeg', 'mp3', 4, 0, 1, 7, ?) RETURNING id",
        )
        .bind(remote_id)
        .fetch_one(catalog.pool())
        .await
        .unwrap();

        row.0
    }

    #[tokio::test]
    async fn cache_prefetches_pinned_items_not_yet_on_disk() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/getCoverArt");
            then.status(200).body(b"art-bytes");
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/download");
            then.status(200).body(b"audio-bytes");
        });

        let origin = origin_config(&server.base_url());
        let client = Arc::new(Client::new(&origin));
        let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
        seed_pinned_item(&catalog, 42).await;

        let dir = tempfile::tempdir().unwrap();
        let item_cache =
            Arc::new(FileCache::new(CacheKind::Item, dir.path().join("items"), 0, 0.2).unwrap());
        let artwork_cache =
            Arc::new(FileCache::new(CacheKind::Artwork, dir.path().join("art"), 0, 0.2).unwrap());

        let mut clients = HashMap::new();
        clients.insert(1, client);

        let manager = CacheManager::new(item_cache, artwork_cache, catalog, clients);
        manager.cache().await.unwrap();

        assert!(dir.path().join("items").join("1").exists());
        assert!(dir.path().join("art").join("1").exists());
    }

    #[tokio::test]
    async fn expire_and_clean_are_no_ops_on_an_empty_cache() {
        let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let item_cache =
            Arc::new(FileCache::new(CacheKind::Item, dir.path().join("items"), 0, 0.2).unwrap());
        let artwork_cache =
            Arc::new(FileCache::new(CacheKind::Artwork, dir.path().join("art"), 0, 0.2).unwrap());

        let manager = CacheManager::new(item_cache, artwork_cache, catalog, HashMap::new());
        manager.expire().await.unwrap();
        manager.clean(false).await.unwrap();
    }

    #[tokio::test]
    async fn prefetch_reports_unknown_origin_without_panicking() {
        let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
        seed_pinned_item(&catalog, 1).await;

        let dir = tempfile::tempdir().unwrap();
        let item_cache =
            Arc::new(FileCache::new(CacheKind::Item, dir.path().join("items"), 0, 0.2).unwrap());
        let artwork_cache =
            Arc::new(FileCache::new(CacheKind::Artwork, dir.path().join("art"), 0, 0.2).unwrap());

        // No client registered for database 1: `cache` must log and continue
        // rather than propagate.
        let manager = CacheManager::new(item_cache, artwork_cache, catalog, HashMap::new());
        manager.cache().await.unwrap();
    }
}
