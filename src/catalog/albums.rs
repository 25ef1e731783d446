use futures::{Stream, StreamExt};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection};

use super::entities::Album;
use super::CatalogError;
use crate::catalog::artists::UpsertOutcome;

#[derive(FromRow)]
struct DbAlbum {
    id: i64,
    database_id: i64,
    artist_id: i64,
    name: String,
    art: bool,
    checksum: i64,
    remote_id: i64,
}

impl From<DbAlbum> for Album {
    fn from(row: DbAlbum) -> Self {
        Self {
            id: row.id,
            database_id: row.database_id,
            artist_id: row.artist_id,
            name: row.name,
            art: row.art,
            checksum: row.checksum as u32,
            remote_id: row.remote_id,
        }
    }
}

const COLUMNS: &str = "id, database_id, artist_id, name, art, checksum, remote_id";

pub struct AlbumsRepository;

impl AlbumsRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn by_remote_id<'e, E>(
        &self,
        executor: E,
        database_id: i64,
        remote_id: i64,
    ) -> Result<Option<Album>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbAlbum>(&format!(
            "SELECT {COLUMNS} FROM album WHERE database_id = ? AND remote_id = ? LIMIT 1"
        ))
        .bind(database_id)
        .bind(remote_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Album::from))
    }

    pub fn stream_all<'e, E>(
        &self,
        executor: E,
        database_id: i64,
    ) -> impl Stream<Item = Result<Album, CatalogError>> + 'e
    where
        E: Executor<'e, Database = Sqlite> + 'e,
    {
        sqlx::query_as::<_, DbAlbum>(&format!("SELECT {COLUMNS} FROM album WHERE database_id = ?"))
            .bind(database_id)
            .fetch(executor)
            .map(|r| r.map(Album::from).map_err(CatalogError::from_sqlx_error))
    }

    /// Upsert by remote id. The album's `name` column is written from
    /// `name` on both insert and update (an upstream variant's update path
    /// wrote the artist name into this column instead; not reproduced here).
    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        database_id: i64,
        artist_id: i64,
        name: &str,
        art: bool,
        remote_id: i64,
        checksum: u32,
    ) -> Result<(Album, UpsertOutcome), CatalogError> {
        let existing = self.by_remote_id(&mut *conn, database_id, remote_id).await?;

        match existing {
            Some(existing) if existing.checksum == checksum => Ok((existing, UpsertOutcome::Unchanged)),
            Some(existing) => {
                sqlx::query("UPDATE album SET name = ?, artist_id = ?, art = ?, checksum = ? WHERE id = ?")
                    .bind(name)
                    .bind(artist_id)
                    .bind(art)
                    .bind(checksum as i64)
                    .bind(existing.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(CatalogError::from_sqlx_error)?;

                Ok((
                    Album {
                        name: name.to_string(),
                        artist_id,
                        art,
                        checksum,
                        ..existing
                    },
                    UpsertOutcome::Updated,
                ))
            }
            None => {
                let row = sqlx::query_as::<_, DbAlbum>(&format!(
                    "INSERT INTO album (database_id, artist_id, name, art, checksum, remote_id)
                     VALUES (?, ?, ?, ?, ?, ?)
                     RETURNING {COLUMNS}"
                ))
                .bind(database_id)
                .bind(artist_id)
                .bind(name)
                .bind(art)
                .bind(checksum as i64)
                .bind(remote_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((Album::from(row), UpsertOutcome::Inserted))
            }
        }
    }

    pub async fn delete<'e, E>(&self, executor: E, id: i64) -> Result<(), CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM album WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(())
    }
}

impl Default for AlbumsRepository {
    fn default() -> Self {
        Self::new()
    }
}
