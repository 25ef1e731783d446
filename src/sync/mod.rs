//! One `Synchronizer` per configured Subsonic origin: walks the remote
//! listing tree, diffs it against the catalog mirror by checksum, and
//! applies the difference inside a single serialized write pass.

pub mod checksum;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;

use crate::catalog::entities::{
    generate_persistent_id, mime_type_for_suffix, Album, Artist, Container, ContainerItem, Database,
    Item,
};
use crate::catalog::items::NewItem;
use crate::catalog::{
    albums::AlbumsRepository, artists::ArtistsRepository, artists::UpsertOutcome,
    container_items::ContainerItemsRepository, containers::ContainersRepository,
    databases::DatabasesRepository, items::ItemsRepository, CatalogError, CatalogStore,
};
use crate::config::{OriginConfig, SynchronizationMode};
use crate::provider::{ChangeSet, Provider, SyncIntents};
use crate::state::{StateError, StateStore, SynchronizerState};
use crate::subsonic::{Client, IndexWalk, RemotePlaylist, SubsonicError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote origin unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("unparseable response from remote origin: {0}")]
    RemoteProtocol(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<SubsonicError> for SyncError {
    fn from(err: SubsonicError) -> Self {
        match err {
            SubsonicError::RemoteUnavailable(e) => SyncError::RemoteUnavailable(e.to_string()),
            SubsonicError::RemoteProtocol(msg) => SyncError::RemoteProtocol(msg),
            SubsonicError::SubsonicFault { code, message } => {
                SyncError::RemoteProtocol(format!("subsonic fault {code}: {message}"))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    /// True when step 1's cheap-skip fired (nothing else in this pass ran).
    pub skipped: bool,
    pub items_changed: bool,
    pub containers_changed: bool,
}

/// One instance per configured origin; owns that origin's Subsonic client
/// and the per-origin slice of state the bridge tracks.
pub struct Synchronizer {
    origin_index: usize,
    origin: OriginConfig,
    database_name: String,
    client: Arc<Client>,
    catalog: Arc<CatalogStore>,
    state: Arc<StateStore>,
    provider: Arc<Provider>,
    initial_sync_done: AtomicBool,

    databases: DatabasesRepository,
    artists: ArtistsRepository,
    albums: AlbumsRepository,
    items: ItemsRepository,
    containers: ContainersRepository,
    container_items: ContainerItemsRepository,
}

impl Synchronizer {
    pub fn new(
        origin_index: usize,
        origin: OriginConfig,
        client: Arc<Client>,
        catalog: Arc<CatalogStore>,
        state: Arc<StateStore>,
        provider: Arc<Provider>,
    ) -> Self {
        let database_name = reqwest::Url::parse(&origin.url)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| origin.url.clone());

        Self {
            origin_index,
            origin,
            database_name,
            client,
            catalog,
            state,
            provider,
            initial_sync_done: AtomicBool::new(false),
            databases: DatabasesRepository::new(),
            artists: ArtistsRepository::new(),
            albums: AlbumsRepository::new(),
            items: ItemsRepository::new(),
            containers: ContainersRepository::new(),
            container_items: ContainerItemsRepository::new(),
        }
    }

    pub fn mode(&self) -> SynchronizationMode {
        self.origin.synchronization
    }

    pub fn interval_minutes(&self) -> Option<u64> {
        self.origin.synchronization_interval_minutes
    }

    pub async fn has_completed_initial_sync(&self) -> bool {
        self.state.synchronizer_state(self.origin_index).await.is_some()
    }

    pub fn label(&self) -> &str {
        &self.database_name
    }

    fn connection_version(&self) -> u32 {
        checksum::adler32_of(&[
            self.origin.url.clone(),
            self.origin.username.clone(),
            self.origin.password.clone(),
        ])
    }

    /// Runs the full sync pass: version probe, then database/artist/album/item
    /// upserts, then container re-materialization, then deletion of anything
    /// no longer present. The bulk of the pass runs inside one `WriteCursor`:
    /// any catalog error aborts and rolls back the entire pass, so either all
    /// its rows commit or none do.
    pub async fn synchronize(&self) -> Result<SyncReport, SyncError> {
        let connection_version = self.connection_version();
        let is_initial = !self.initial_sync_done.swap(true, Ordering::SeqCst);

        if is_initial {
            if let Some(stored) = self.state.synchronizer_state(self.origin_index).await {
                if stored.connection_version == connection_version {
                    log::info!(
                        "{}: connection unchanged since last run, skipping initial sync",
                        self.label()
                    );
                    return Ok(SyncReport {
                        skipped: true,
                        ..Default::default()
                    });
                }
            }
        }

        let stored_state_opt = self.state.synchronizer_state(self.origin_index).await;
        let never_synced = stored_state_opt.is_none();
        let stored_state = stored_state_opt.unwrap_or(SynchronizerState {
            connection_version,
            items_version: None,
            containers_version: 0,
        });

        let index_walk = self.client.walk_index(stored_state.items_version.as_deref()).await?;
        let new_items_version = index_walk
            .last_modified
            .clone()
            .or_else(|| stored_state.items_version.clone());
        let items_changed = never_synced || new_items_version != stored_state.items_version;

        let playlists = self.client.walk_playlists().await?;
        let new_containers_version = playlists.iter().fold(0u32, |acc, playlist| {
            acc.wrapping_add(checksum::adler32_of(&[
                playlist.name.clone(),
                playlist.changed.clone().unwrap_or_default(),
            ]))
        });
        let containers_changed = never_synced || new_containers_version != stored_state.containers_version;

        let mut cursor = self.catalog.begin_write().await?;
        let pass_result = self
            .run_pass(cursor.as_mut(), &index_walk, items_changed, &playlists, containers_changed)
            .await;

        let intents = match pass_result {
            Ok(intents) => {
                cursor.commit().await?;
                intents
            }
            Err(err) => {
                let _ = cursor.rollback().await;
                return Err(err);
            }
        };

        let any_change = !intents.is_empty();
        self.provider.apply_sync(intents);

        if any_change {
            self.state
                .set_synchronizer_state(
                    self.origin_index,
                    SynchronizerState {
                        connection_version,
                        items_version: new_items_version,
                        containers_version: new_containers_version,
                    },
                )
                .await?;
            self.state.save().await?;
        }

        Ok(SyncReport {
            skipped: false,
            items_changed,
            containers_changed,
        })
    }

    /// Step 3: database and base-container upsert, shared by a full sync
    /// pass and by `ensure_database` (the latter lets an embedder learn the
    /// catalog `database_id` for this origin before the first sync runs).
    async fn upsert_database_and_base(
        &self,
        conn: &mut sqlx::SqliteConnection,
    ) -> Result<(Database, Container), SyncError> {
        let database_checksum = checksum::adler32_of(&Database::canonical_checksum_fields(
            &self.database_name,
            Some(self.origin_index as i64),
        ));
        let (database, _) = self
            .databases
            .upsert(
                conn,
                &self.database_name,
                self.origin_index as i64,
                database_checksum,
                generate_persistent_id(),
            )
            .await?;

        let base_checksum =
            checksum::adler32_of(&Container::canonical_base_checksum_fields(&self.database_name));
        let (base_container, _) = self
            .containers
            .upsert_base(conn, database.id, &self.database_name, base_checksum, generate_persistent_id())
            .await?;

        Ok((database, base_container))
    }

    /// Ensures this origin's `database` and base-container rows exist and
    /// returns the database row, without touching items or containers.
    /// Lets an embedder learn `database_id` up front, so it can register a
    /// Subsonic client with the Provider before the first `synchronize()`
    /// pass has run.
    pub async fn ensure_database(&self) -> Result<Database, SyncError> {
        let mut cursor = self.catalog.begin_write().await?;
        let (database, _base_container) = self.upsert_database_and_base(cursor.as_mut()).await?;
        cursor.commit().await?;
        Ok(database)
    }

    /// Steps 3-5: database/base-container upsert, items diff, containers
    /// diff, all against one `SqliteConnection` borrowed from the caller's
    /// `WriteCursor`.
    async fn run_pass(
        &self,
        conn: &mut sqlx::SqliteConnection,
        index_walk: &IndexWalk,
        items_changed: bool,
        playlists: &[RemotePlaylist],
        containers_changed: bool,
    ) -> Result<SyncIntents, SyncError> {
        let (database, base_container) = self.upsert_database_and_base(conn).await?;

        let (items_intents, base_container_items_intents) = if items_changed {
            self.sync_items(conn, &database, &base_container, index_walk).await?
        } else {
            (ChangeSet::default(), ChangeSet::default())
        };

        let (containers_intents, container_items_intents) = if containers_changed {
            self.sync_containers(conn, &database, playlists).await?
        } else {
            (ChangeSet::default(), ChangeSet::default())
        };

        Ok(SyncIntents {
            items: items_intents,
            base_container_items: base_container_items_intents,
            containers: containers_intents,
            container_items: container_items_intents,
        })
    }

    /// Step 4: the leaf-song walk. Resolves each song's artist (real →
    /// synthetic), its album (via the artist's `getArtist` album list,
    /// fetched once per artist per pass), upserts the item row, mirrors it
    /// into the base container, then deletes whatever wasn't touched.
    async fn sync_items(
        &self,
        conn: &mut sqlx::SqliteConnection,
        database: &Database,
        base_container: &Container,
        index_walk: &IndexWalk,
    ) -> Result<(ChangeSet<i64>, ChangeSet<i64>), SyncError> {
        let existing_items_by_remote: HashMap<i64, Item> = self
            .items
            .stream_all(&mut *conn, database.id)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|item| (item.remote_id, item))
            .collect();

        let mut existing_real_artists_by_remote: HashMap<i64, Artist> = HashMap::new();
        let mut existing_synthetic_artists_by_name: HashMap<String, Artist> = HashMap::new();
        for artist in self.artists.stream_all(&mut *conn, database.id).try_collect::<Vec<_>>().await? {
            match artist.remote_id {
                Some(remote_id) => {
                    existing_real_artists_by_remote.insert(remote_id, artist);
                }
                None => {
                    existing_synthetic_artists_by_name.insert(artist.name.clone(), artist);
                }
            }
        }

        let existing_albums_by_remote: HashMap<i64, Album> = self
            .albums
            .stream_all(&mut *conn, database.id)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|album| (album.remote_id, album))
            .collect();

        let existing_base_items_by_item: HashMap<i64, ContainerItem> = self
            .container_items
            .stream_by_container(&mut *conn, base_container.id)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|ci| (ci.item_id, ci))
            .collect();

        // This pass's working view of albums, seeded from the existing rows
        // and extended as `walk_artist` discovers new ones. Kept separate
        // from the snapshot above, which stays frozen for the deletion diff.
        let mut albums_by_remote = existing_albums_by_remote.clone();

        let mut touched_item_remote_ids: HashSet<i64> = HashSet::new();
        let mut touched_real_artist_remote_ids: HashSet<i64> = HashSet::new();
        let mut touched_synthetic_artist_names: HashSet<String> = HashSet::new();
        let mut touched_album_remote_ids: HashSet<i64> = HashSet::new();
        let mut touched_local_item_ids: HashSet<i64> = HashSet::new();

        let mut items_inserted_or_updated = Vec::new();
        let mut base_container_items_inserted_or_updated = Vec::new();

        for song in &index_walk.songs {
            let remote_item_id = song.id as i64;

            let mut resolved_artist_id: Option<i64> = None;
            let mut album_artist_id: Option<i64> = None;
            let mut album_row_id: Option<i64> = None;

            if let Some(remote_artist_id_u64) = song.artist_id {
                let remote_artist_id = remote_artist_id_u64 as i64;
                let artist_name = song.artist.clone().unwrap_or_else(|| "Unknown Artist".to_string());
                let artist_checksum =
                    checksum::adler32_of(&Artist::canonical_checksum_fields(&artist_name, Some(remote_artist_id)));

                let (artist_row, _) = self
                    .artists
                    .upsert(conn, database.id, &artist_name, Some(remote_artist_id), artist_checksum)
                    .await?;
                resolved_artist_id = Some(artist_row.id);

                let first_time_for_artist = touched_real_artist_remote_ids.insert(remote_artist_id);
                if first_time_for_artist {
                    let remote_albums = self.client.walk_artist(remote_artist_id_u64).await?;
                    for remote_album in remote_albums {
                        let album_remote_id = remote_album.id as i64;
                        let has_art = remote_album.cover_art.is_some();
                        let album_checksum = checksum::adler32_of(&Album::canonical_checksum_fields(
                            &remote_album.name,
                            has_art,
                            album_remote_id,
                        ));
                        let (album_row, _) = self
                            .albums
                            .upsert(
                                conn,
                                database.id,
                                artist_row.id,
                                &remote_album.name,
                                has_art,
                                album_remote_id,
                                album_checksum,
                            )
                            .await?;
                        touched_album_remote_ids.insert(album_remote_id);
                        albums_by_remote.insert(album_remote_id, album_row);
                    }
                }
            } else if let Some(name) = song.artist.as_deref().filter(|n| !n.is_empty()) {
                let synthetic_checksum =
                    checksum::adler32_of(&Artist::canonical_checksum_fields(name, None));
                let (artist_row, _) = self.artists.upsert(conn, database.id, name, None, synthetic_checksum).await?;
                touched_synthetic_artist_names.insert(name.to_string());
                resolved_artist_id = Some(artist_row.id);
            }

            if let Some(remote_album_id_u64) = song.album_id {
                if let Some(album_row) = albums_by_remote.get(&(remote_album_id_u64 as i64)) {
                    album_row_id = Some(album_row.id);
                    album_artist_id = Some(album_row.artist_id);
                }
            }

            let effective_artist_id = resolved_artist_id.or(album_artist_id);

            let duration_ms = song.duration.saturating_mul(1000);
            let file_name = std::path::Path::new(&song.path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| song.title.clone());
            let file_type = song
                .content_type
                .clone()
                .unwrap_or_else(|| mime_type_for_suffix(&song.suffix).to_string());

            let item_checksum = checksum::adler32_of(&Item::canonical_checksum_fields(
                &song.title,
                song.genre.as_deref(),
                song.year,
                song.track,
                duration_ms,
                song.bit_rate,
                &file_name,
                song.size,
                remote_item_id,
            ));

            // A fresh persistent_id is wasted (never written) when the row
            // already exists, since the repository's UPDATE path never
            // touches that column, so generating one unconditionally is safe.
            let (item_row, outcome) = self
                .items
                .upsert(
                    conn,
                    NewItem {
                        database_id: database.id,
                        persistent_id: generate_persistent_id(),
                        artist_id: effective_artist_id,
                        album_artist_id,
                        album_id: album_row_id,
                        name: &song.title,
                        genre: song.genre.as_deref(),
                        year: song.year,
                        track: song.track,
                        duration: duration_ms,
                        bitrate: song.bit_rate,
                        file_name: &file_name,
                        file_type: &file_type,
                        file_suffix: &song.suffix,
                        file_size: song.size,
                        remote_id: remote_item_id,
                        checksum: item_checksum,
                    },
                )
                .await?;

            touched_item_remote_ids.insert(remote_item_id);
            if !matches!(outcome, UpsertOutcome::Unchanged) {
                items_inserted_or_updated.push(item_row.id);
            }

            let order = existing_base_items_by_item.get(&item_row.id).and_then(|ci| ci.order);
            let base_item = self
                .container_items
                .ensure(&mut *conn, database.id, base_container.id, item_row.id, order)
                .await?;
            if !existing_base_items_by_item.contains_key(&item_row.id) {
                base_container_items_inserted_or_updated.push(base_item.id);
            }
            touched_local_item_ids.insert(item_row.id);
        }

        let items_to_delete: Vec<Item> = existing_items_by_remote
            .into_iter()
            .filter(|(remote_id, _)| !touched_item_remote_ids.contains(remote_id))
            .map(|(_, item)| item)
            .collect();

        let base_items_to_delete: Vec<ContainerItem> = existing_base_items_by_item
            .into_iter()
            .filter(|(item_id, _)| !touched_local_item_ids.contains(item_id))
            .map(|(_, ci)| ci)
            .collect();

        let real_artists_to_delete: Vec<Artist> = existing_real_artists_by_remote
            .into_iter()
            .filter(|(remote_id, _)| !touched_real_artist_remote_ids.contains(remote_id))
            .map(|(_, artist)| artist)
            .collect();

        let synthetic_artists_to_delete: Vec<Artist> = existing_synthetic_artists_by_name
            .into_iter()
            .filter(|(name, _)| !touched_synthetic_artist_names.contains(name))
            .map(|(_, artist)| artist)
            .collect();

        let albums_to_delete: Vec<Album> = existing_albums_by_remote
            .into_iter()
            .filter(|(remote_id, _)| !touched_album_remote_ids.contains(remote_id))
            .map(|(_, album)| album)
            .collect();

        let mut removed_base_container_items = Vec::new();
        for ci in &base_items_to_delete {
            self.container_items.delete(&mut *conn, ci.id).await?;
            removed_base_container_items.push(ci.id);
        }

        let mut removed_items = Vec::new();
        for item in &items_to_delete {
            self.items.delete(&mut *conn, item.id).await?;
            removed_items.push(item.id);
        }

        for artist in real_artists_to_delete.iter().chain(synthetic_artists_to_delete.iter()) {
            self.artists.delete(&mut *conn, artist.id).await?;
        }

        for album in &albums_to_delete {
            self.albums.delete(&mut *conn, album.id).await?;
        }

        log::debug!(
            "{}: items sync: {} touched, {} removed, {} artists removed, {} albums removed",
            self.label(),
            items_inserted_or_updated.len(),
            removed_items.len(),
            real_artists_to_delete.len() + synthetic_artists_to_delete.len(),
            albums_to_delete.len(),
        );

        Ok((
            ChangeSet {
                inserted_or_updated: items_inserted_or_updated,
                removed: removed_items,
            },
            ChangeSet {
                inserted_or_updated: base_container_items_inserted_or_updated,
                removed: removed_base_container_items,
            },
        ))
    }

    /// Step 5: re-materializes any playlist whose checksum changed and
    /// deletes containers no longer reported by the origin.
    async fn sync_containers(
        &self,
        conn: &mut sqlx::SqliteConnection,
        database: &Database,
        playlists: &[RemotePlaylist],
    ) -> Result<(ChangeSet<i64>, ChangeSet<i64>), SyncError> {
        let existing_containers_by_remote: HashMap<i64, Container> = self
            .containers
            .stream_non_base(&mut *conn, database.id)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .filter_map(|c| c.remote_id.map(|remote_id| (remote_id, c)))
            .collect();

        // Re-read items fresh: when `items_changed` was false this pass,
        // `sync_items` never ran and this is the only up-to-date view.
        let items_by_remote: HashMap<i64, Item> = self
            .items
            .stream_all(&mut *conn, database.id)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|item| (item.remote_id, item))
            .collect();

        let mut touched_container_remote_ids: HashSet<i64> = HashSet::new();
        let mut containers_inserted_or_updated = Vec::new();
        let mut container_items_inserted_or_updated = Vec::new();

        for playlist in playlists {
            let remote_container_id = playlist.id as i64;
            let checksum_val =
                checksum::adler32_of(&Container::canonical_checksum_fields(&playlist.name, playlist.changed.as_deref()));

            let (container_row, outcome) = self
                .containers
                .upsert_playlist(
                    conn,
                    database.id,
                    &playlist.name,
                    remote_container_id,
                    checksum_val,
                    generate_persistent_id(),
                )
                .await?;
            touched_container_remote_ids.insert(remote_container_id);

            if matches!(outcome, UpsertOutcome::Unchanged) {
                continue;
            }
            containers_inserted_or_updated.push(container_row.id);

            self.container_items.delete_all_for_container(&mut *conn, container_row.id).await?;

            let entries = self.client.walk_playlist(playlist.id).await?;
            for entry in entries {
                let (song, order) = entry.into_song();
                let remote_song_id = song.id as i64;
                let Some(item) = items_by_remote.get(&remote_song_id) else {
                    log::warn!(
                        "{}: playlist {} references item {} not present in the catalog, skipping entry",
                        self.label(),
                        playlist.id,
                        song.id
                    );
                    continue;
                };

                let container_item = self
                    .container_items
                    .ensure(&mut *conn, database.id, container_row.id, item.id, Some(order))
                    .await?;
                container_items_inserted_or_updated.push(container_item.id);
            }
        }

        let containers_to_delete: Vec<Container> = existing_containers_by_remote
            .into_iter()
            .filter(|(remote_id, _)| !touched_container_remote_ids.contains(remote_id))
            .map(|(_, container)| container)
            .collect();

        let mut removed_containers = Vec::new();
        let mut removed_container_items = Vec::new();
        for container in &containers_to_delete {
            let removed = self
                .container_items
                .stream_by_container(&mut *conn, container.id)
                .try_collect::<Vec<ContainerItem>>()
                .await?;
            for ci in &removed {
                removed_container_items.push(ci.id);
            }
            self.container_items.delete_all_for_container(&mut *conn, container.id).await?;
            self.containers.delete(&mut *conn, container.id).await?;
            removed_containers.push(container.id);
        }

        Ok((
            ChangeSet {
                inserted_or_updated: containers_inserted_or_updated,
                removed: removed_containers,
            },
            ChangeSet {
                inserted_or_updated: container_items_inserted_or_updated,
                removed: removed_container_items,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKind, FileCache};
    use crate::config::TranscodeMode;
    use httpmock::prelude::*;
    use std::collections::HashSet as StdHashSet;

    fn origin_config(base_url: &str) -> OriginConfig {
        OriginConfig {
            url: base_url.to_string(),
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            synchronization: SynchronizationMode::Manual,
            synchronization_interval_minutes: None,
            transcode: TranscodeMode::No,
            transcode_unsupported: StdHashSet::new(),
        }
    }

    fn index_body() -> serde_json::Value {
        serde_json::json!({
            "subsonic-response": {
                "status": "ok",
                "indexes": {
                    "lastModified": "1",
                    "index": [{
                        "name": "A",
                        "artist": [{"id": 1, "name": "Artist One"}]
                    }],
                    "child": []
                }
            }
        })
    }

    fn artist_body() -> serde_json::Value {
        serde_json::json!({
            "subsonic-response": {
                "status": "ok",
                "artist": {
                    "id": 1,
                    "name": "Artist One",
                    "album": [{"id": 10, "name": "Album One", "artistId": 1}]
                }
            }
        })
    }

    fn directory_body() -> serde_json::Value {
        serde_json::json!({
            "subsonic-response": {
                "status": "ok",
                "directory": {
                    "id": 1,
                    "child": [{
                        "id": 100,
                        "isDir": false,
                        "title": "Song One",
                        "artist": "Artist One",
                        "artistId": 1,
                        "albumId": 10,
                        "duration": 200,
                        "suffix": "mp3",
                        "path": "Artist One/Album One/Song One.mp3",
                        "size": 4000
                    }]
                }
            }
        })
    }

    fn empty_playlists_body() -> serde_json::Value {
        serde_json::json!({"subsonic-response": {"status": "ok", "playlists": {"playlist": []}}})
    }

    async fn new_provider() -> Arc<Provider> {
        let dir = tempfile::tempdir().unwrap();
        let item_cache =
            Arc::new(FileCache::new(CacheKind::Item, dir.path().join("items"), 0, 0.2).unwrap());
        let artwork_cache =
            Arc::new(FileCache::new(CacheKind::Artwork, dir.path().join("art"), 0, 0.2).unwrap());
        Arc::new(Provider::new(item_cache, artwork_cache))
    }

    #[tokio::test]
    async fn first_sync_populates_catalog_and_is_idempotent() {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(GET).path("/rest/getIndexes");
            then.status(200).json_body(index_body());
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getMusicDirectory");
            then.status(200).json_body(directory_body());
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getArtist");
            then.status(200).json_body(artist_body());
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getPlaylists");
            then.status(200).json_body(empty_playlists_body());
        });

        let origin = origin_config(&server.base_url());
        let client = Arc::new(Client::new(&origin));
        let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());
        let provider = new_provider().await;

        let synchronizer = Synchronizer::new(0, origin, client, Arc::clone(&catalog), state, provider);

        let report = synchronizer.synchronize().await.unwrap();
        assert!(!report.skipped);
        assert!(report.items_changed);

        let items = ItemsRepository::new()
            .stream_all(catalog.pool(), 1)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Song One");
        assert_eq!(items[0].duration, 200_000);

        // A second pass against an unchanged remote must not re-hit getArtist
        // and must leave the row checksums (hence the rows) untouched.
        let report2 = synchronizer.synchronize().await.unwrap();
        assert!(!report2.items_changed);

        let items_again = ItemsRepository::new()
            .stream_all(catalog.pool(), 1)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(items_again.len(), 1);
        assert_eq!(items_again[0].id, items[0].id);
    }

    #[tokio::test]
    async fn removed_remote_song_deletes_its_catalog_row() {
        let server = MockServer::start();

        let index_mock = server.mock(|when, then| {
            when.method(GET).path("/rest/getIndexes");
            then.status(200).json_body(index_body());
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getMusicDirectory");
            then.status(200).json_body(directory_body());
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getArtist");
            then.status(200).json_body(artist_body());
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getPlaylists");
            then.status(200).json_body(empty_playlists_body());
        });

        let origin = origin_config(&server.base_url());
        let client = Arc::new(Client::new(&origin));
        let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());
        let provider = new_provider().await;

        let synchronizer =
            Synchronizer::new(0, origin.clone(), Arc::clone(&client), Arc::clone(&catalog), Arc::clone(&state), Arc::clone(&provider));
        synchronizer.synchronize().await.unwrap();

        index_mock.delete();
        server.mock(|when, then| {
            when.method(GET).path("/rest/getIndexes");
            then.status(200).json_body(serde_json::json!({
                "subsonic-response": {
                    "status": "ok",
                    "indexes": {"lastModified": "2", "index": [], "child": []}
                }
            }));
        });

        // Force a fresh process-lifetime synchronizer so the cheap-skip at
        // step 1 does not short-circuit this second, content-changing pass.
        let synchronizer2 = Synchronizer::new(0, origin, client, catalog.clone(), state, provider);
        let report = synchronizer2.synchronize().await.unwrap();
        assert!(report.items_changed);

        let items = ItemsRepository::new()
            .stream_all(catalog.pool(), 1)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert!(items.is_empty());
    }
}
