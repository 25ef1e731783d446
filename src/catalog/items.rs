use futures::{Stream, StreamExt};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection};

use super::entities::Item;
use super::CatalogError;
use crate::catalog::artists::UpsertOutcome;

#[derive(FromRow)]
struct DbItem {
    id: i64,
    persistent_id: i64,
    database_id: i64,
    artist_id: Option<i64>,
    album_artist_id: Option<i64>,
    album_id: Option<i64>,
    name: String,
    genre: Option<String>,
    year: Option<i64>,
    track: Option<i64>,
    duration: i64,
    bitrate: Option<i64>,
    file_name: String,
    file_type: String,
    file_suffix: String,
    file_size: i64,
    exclude: bool,
    cache: bool,
    checksum: i64,
    remote_id: i64,
}

impl From<DbItem> for Item {
    fn from(row: DbItem) -> Self {
        Self {
            id: row.id,
            persistent_id: row.persistent_id,
            database_id: row.database_id,
            artist_id: row.artist_id,
            album_artist_id: row.album_artist_id,
            album_id: row.album_id,
            name: row.name,
            genre: row.genre,
            year: row.year,
            track: row.track,
            duration: row.duration,
            bitrate: row.bitrate,
            file_name: row.file_name,
            file_type: row.file_type,
            file_suffix: row.file_suffix,
            file_size: row.file_size,
            exclude: row.exclude,
            cache: row.cache,
            checksum: row.checksum as u32,
            remote_id: row.remote_id,
        }
    }
}

const COLUMNS: &str = "id, persistent_id, database_id, artist_id, album_artist_id, album_id, \
    name, genre, year, track, duration, bitrate, file_name, file_type, file_suffix, \
    file_size, exclude, cache, checksum, remote_id";

/// Fields accepted for an item upsert; grouped to keep the repository
/// method's argument list manageable.
pub struct NewItem<'a> {
    pub database_id: i64,
    pub persistent_id: i64,
    pub artist_id: Option<i64>,
    pub album_artist_id: Option<i64>,
    pub album_id: Option<i64>,
    pub name: &'a str,
    pub genre: Option<&'a str>,
    pub year: Option<i64>,
    pub track: Option<i64>,
    pub duration: i64,
    pub bitrate: Option<i64>,
    pub file_name: &'a str,
    pub file_type: &'a str,
    pub file_suffix: &'a str,
    pub file_size: i64,
    pub remote_id: i64,
    pub checksum: u32,
}

pub struct ItemsRepository;

impl ItemsRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn by_id<'e, E>(&self, executor: E, id: i64) -> Result<Option<Item>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbItem>(&format!("SELECT {COLUMNS} FROM item WHERE id = ?"))
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Item::from))
    }

    pub async fn by_remote_id<'e, E>(
        &self,
        executor: E,
        database_id: i64,
        remote_id: i64,
    ) -> Result<Option<Item>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbItem>(&format!(
            "SELECT {COLUMNS} FROM item WHERE database_id = ? AND remote_id = ? LIMIT 1"
        ))
        .bind(database_id)
        .bind(remote_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Item::from))
    }

    pub fn stream_all<'e, E>(
        &self,
        executor: E,
        database_id: i64,
    ) -> impl Stream<Item = Result<Item, CatalogError>> + 'e
    where
        E: Executor<'e, Database = Sqlite> + 'e,
    {
        sqlx::query_as::<_, DbItem>(&format!("SELECT {COLUMNS} FROM item WHERE database_id = ?"))
            .bind(database_id)
            .fetch(executor)
            .map(|r| r.map(Item::from).map_err(CatalogError::from_sqlx_error))
    }

    /// Query the set of permanently-pinned, non-excluded items: the
    /// Cache Manager's `cache=1 AND exclude=0` prefetch set.
    pub async fn permanently_cached<'e, E>(&self, executor: E) -> Result<Vec<Item>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, DbItem>(&format!(
            "SELECT {COLUMNS} FROM item WHERE cache = 1 AND exclude = 0"
        ))
        .fetch_all(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(rows.into_iter().map(Item::from).collect())
    }

    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        new: NewItem<'_>,
    ) -> Result<(Item, UpsertOutcome), CatalogError> {
        let existing = self
            .by_remote_id(&mut *conn, new.database_id, new.remote_id)
            .await?;

        match existing {
            Some(existing) if existing.checksum == new.checksum => {
                Ok((existing, UpsertOutcome::Unchanged))
            }
            Some(existing) => {
                sqlx::query(
                    "UPDATE item SET artist_id = ?, album_artist_id = ?, album_id = ?, name = ?, \
                     genre = ?, year = ?, track = ?, duration = ?, bitrate = ?, file_name = ?, \
                     file_type = ?, file_suffix = ?, file_size = ?, checksum = ? WHERE id = ?",
                )
                .bind(new.artist_id)
                .bind(new.album_artist_id)
                .bind(new.album_id)
                .bind(new.name)
                .bind(new.genre)
                .bind(new.year)
                .bind(new.track)
                .bind(new.duration)
                .bind(new.bitrate)
                .bind(new.file_name)
                .bind(new.file_type)
                .bind(new.file_suffix)
                .bind(new.file_size)
                .bind(new.checksum as i64)
                .bind(existing.id)
                .execute(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((
                    Item {
                        artist_id: new.artist_id,
                        album_artist_id: new.album_artist_id,
                        album_id: new.album_id,
                        name: new.name.to_string(),
                        genre: new.genre.map(|s| s.to_string()),
                        year: new.year,
                        track: new.track,
                        duration: new.duration,
                        bitrate: new.bitrate,
                        file_name: new.file_name.to_string(),
                        file_type: new.file_type.to_string(),
                        file_suffix: new.file_suffix.to_string(),
                        file_size: new.file_size,
                        checksum: new.checksum,
                        ..existing
                    },
                    UpsertOutcome::Updated,
                ))
            }
            None => {
                let row = sqlx::query_as::<_, DbItem>(&format!(
                    "INSERT INTO item (persistent_id, database_id, artist_id, album_artist_id, \
                     album_id, name, genre, year, track, duration, bitrate, file_name, \
                     file_type, file_suffix, file_size, exclude, cache, checksum, remote_id)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
                     RETURNING {COLUMNS}"
                ))
                .bind(new.persistent_id)
                .bind(new.database_id)
                .bind(new.artist_id)
                .bind(new.album_artist_id)
                .bind(new.album_id)
                .bind(new.name)
                .bind(new.genre)
                .bind(new.year)
                .bind(new.track)
                .bind(new.duration)
                .bind(new.bitrate)
                .bind(new.file_name)
                .bind(new.file_type)
                .bind(new.file_suffix)
                .bind(new.file_size)
                .bind(new.checksum as i64)
                .bind(new.remote_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((Item::from(row), UpsertOutcome::Inserted))
            }
        }
    }

    pub async fn delete<'e, E>(&self, executor: E, id: i64) -> Result<(), CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM item WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(())
    }
}

impl Default for ItemsRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;

    async fn seed_database(store: &CatalogStore) {
        sqlx::query(
            "INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id) VALUES (1, 'db', 0, 0, 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();
    }

    fn new_item(name: &'static str, checksum: u32) -> NewItem<'static> {
        NewItem {
            database_id: 1,
            persistent_id: 1,
            artist_id: None,
            album_artist_id: None,
            album_id: None,
            name,
            genre: None,
            year: None,
            track: None,
            duration: 1000,
            bitrate: None,
            file_name: "track.mp3",
            file_type: "audio/mpeg",
            file_suffix: "mp3",
            file_size: 4096,
            remote_id: 7,
            checksum,
        }
    }

    #[tokio::test]
    async fn insert_then_unchanged_then_update() {
        let store = CatalogStore::in_memory().await.unwrap();
        seed_database(&store).await;
        let repo = ItemsRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();

        let (item, outcome) = repo.upsert(&mut conn, new_item("Track", 111)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let (_, outcome) = repo.upsert(&mut conn, new_item("Track", 111)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let (updated, outcome) = repo.upsert(&mut conn, new_item("Track (Remaster)", 222)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(updated.id, item.id);
        assert_eq!(updated.name, "Track (Remaster)");
    }

    #[tokio::test]
    async fn permanently_cached_filters_on_cache_and_exclude() {
        let store = CatalogStore::in_memory().await.unwrap();
        seed_database(&store).await;
        let repo = ItemsRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();
        let (pinned, _) = repo.upsert(&mut conn, new_item("Pinned", 1)).await.unwrap();
        sqlx::query("UPDATE item SET cache = 1 WHERE id = ?")
            .bind(pinned.id)
            .execute(store.pool())
            .await
            .unwrap();

        let mut excluded = new_item("Excluded", 2);
        excluded.remote_id = 8;
        let (excluded, _) = repo.upsert(&mut conn, excluded).await.unwrap();
        sqlx::query("UPDATE item SET cache = 1, exclude = 1 WHERE id = ?")
            .bind(excluded.id)
            .execute(store.pool())
            .await
            .unwrap();

        let cached = repo.permanently_cached(store.pool()).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, pinned.id);
    }
}
