use futures::{Stream, StreamExt};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection};

use super::entities::Artist;
use super::CatalogError;

#[derive(FromRow)]
struct DbArtist {
    id: i64,
    database_id: i64,
    name: String,
    exclude: bool,
    checksum: i64,
    remote_id: Option<i64>,
}

impl From<DbArtist> for Artist {
    fn from(row: DbArtist) -> Self {
        Self {
            id: row.id,
            database_id: row.database_id,
            name: row.name,
            exclude: row.exclude,
            checksum: row.checksum as u32,
            remote_id: row.remote_id,
        }
    }
}

const COLUMNS: &str = "id, database_id, name, exclude, checksum, remote_id";

/// Outcome of an upsert-by-checksum: distinguishes an unchanged row (no
/// write issued) from one that was inserted or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

pub struct ArtistsRepository;

impl ArtistsRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn by_remote_id<'e, E>(
        &self,
        executor: E,
        database_id: i64,
        remote_id: i64,
    ) -> Result<Option<Artist>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbArtist>(&format!(
            "SELECT {COLUMNS} FROM artist WHERE database_id = ? AND remote_id = ? LIMIT 1"
        ))
        .bind(database_id)
        .bind(remote_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Artist::from))
    }

    pub async fn synthetic_by_name<'e, E>(
        &self,
        executor: E,
        database_id: i64,
        name: &str,
    ) -> Result<Option<Artist>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbArtist>(&format!(
            "SELECT {COLUMNS} FROM artist WHERE database_id = ? AND name = ? AND remote_id IS NULL LIMIT 1"
        ))
        .bind(database_id)
        .bind(name)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Artist::from))
    }

    pub fn stream_all<'e, E>(
        &self,
        executor: E,
        database_id: i64,
    ) -> impl Stream<Item = Result<Artist, CatalogError>> + 'e
    where
        E: Executor<'e, Database = Sqlite> + 'e,
    {
        sqlx::query_as::<_, DbArtist>(&format!(
            "SELECT {COLUMNS} FROM artist WHERE database_id = ?"
        ))
        .bind(database_id)
        .fetch(executor)
        .map(|r| r.map(Artist::from).map_err(CatalogError::from_sqlx_error))
    }

    /// Upsert by remote id (real artist) or by `(database_id, name)` for a
    /// synthetic artist (`remote_id = None`). Leaves the row untouched (no
    /// UPDATE) when the computed checksum matches the stored one.
    ///
    /// Takes a concrete `&mut SqliteConnection` (rather than a generic
    /// `Executor`) because it issues more than one query against the same
    /// connection; callers reborrow a pool connection or transaction via
    /// `&mut *conn`.
    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        database_id: i64,
        name: &str,
        remote_id: Option<i64>,
        checksum: u32,
    ) -> Result<(Artist, UpsertOutcome), CatalogError> {
        let existing = match remote_id {
            Some(rid) => self.by_remote_id(&mut *conn, database_id, rid).await?,
            None => self.synthetic_by_name(&mut *conn, database_id, name).await?,
        };

        match existing {
            Some(existing) if existing.checksum == checksum => Ok((existing, UpsertOutcome::Unchanged)),
            Some(existing) => {
                sqlx::query("UPDATE artist SET name = ?, checksum = ? WHERE id = ?")
                    .bind(name)
                    .bind(checksum as i64)
                    .bind(existing.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(CatalogError::from_sqlx_error)?;

                Ok((
                    Artist {
                        name: name.to_string(),
                        checksum,
                        ..existing
                    },
                    UpsertOutcome::Updated,
                ))
            }
            None => {
                let row = sqlx::query_as::<_, DbArtist>(&format!(
                    "INSERT INTO artist (database_id, name, exclude, checksum, remote_id)
                     VALUES (?, ?, 0, ?, ?)
                     RETURNING {COLUMNS}"
                ))
                .bind(database_id)
                .bind(name)
                .bind(checksum as i64)
                .bind(remote_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((Artist::from(row), UpsertOutcome::Inserted))
            }
        }
    }

    pub async fn delete<'e, E>(&self, executor: E, id: i64) -> Result<(), CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM artist WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(())
    }
}

impl Default for ArtistsRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;

    #[tokio::test]
    async fn insert_then_unchanged_then_update() {
        let store = CatalogStore::in_memory().await.unwrap();
        sqlx::query("INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id) VALUES (1, 'db', 0, 0, 1)")
            .execute(store.pool())
            .await
            .unwrap();

        let repo = ArtistsRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();
        let (artist, outcome) = repo
            .upsert(&mut conn, 1, "Artist A", Some(10), 111)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let (_, outcome) = repo
            .upsert(&mut conn, 1, "Artist A", Some(10), 111)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let (updated, outcome) = repo
            .upsert(&mut conn, 1, "Artist A2", Some(10), 222)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(updated.id, artist.id);
        assert_eq!(updated.name, "Artist A2");
    }

    #[tokio::test]
    async fn synthetic_artist_keyed_by_name() {
        let store = CatalogStore::in_memory().await.unwrap();
        sqlx::query("INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id) VALUES (1, 'db', 0, 0, 1)")
            .execute(store.pool())
            .await
            .unwrap();

        let repo = ArtistsRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();
        let (artist, outcome) = repo
            .upsert(&mut conn, 1, "Free Text Artist", None, 1)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert!(artist.is_synthetic());

        let found = repo
            .synthetic_by_name(store.pool(), 1, "Free Text Artist")
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
