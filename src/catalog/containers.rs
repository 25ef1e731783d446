use futures::{Stream, StreamExt};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection};

use super::entities::Container;
use super::CatalogError;
use crate::catalog::artists::UpsertOutcome;

#[derive(FromRow)]
struct DbContainer {
    id: i64,
    persistent_id: i64,
    database_id: i64,
    parent_id: Option<i64>,
    name: String,
    is_base: bool,
    is_smart: bool,
    exclude: bool,
    cache: bool,
    checksum: i64,
    remote_id: Option<i64>,
}

impl From<DbContainer> for Container {
    fn from(row: DbContainer) -> Self {
        Self {
            id: row.id,
            persistent_id: row.persistent_id,
            database_id: row.database_id,
            parent_id: row.parent_id,
            name: row.name,
            is_base: row.is_base,
            is_smart: row.is_smart,
            exclude: row.exclude,
            cache: row.cache,
            checksum: row.checksum as u32,
            remote_id: row.remote_id,
        }
    }
}

const COLUMNS: &str = "id, persistent_id, database_id, parent_id, name, is_base, is_smart, \
    exclude, cache, checksum, remote_id";

pub struct ContainersRepository;

impl ContainersRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn base_container<'e, E>(
        &self,
        executor: E,
        database_id: i64,
    ) -> Result<Option<Container>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbContainer>(&format!(
            "SELECT {COLUMNS} FROM container WHERE database_id = ? AND is_base = 1 LIMIT 1"
        ))
        .bind(database_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Container::from))
    }

    pub async fn by_remote_id<'e, E>(
        &self,
        executor: E,
        database_id: i64,
        remote_id: i64,
    ) -> Result<Option<Container>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbContainer>(&format!(
            "SELECT {COLUMNS} FROM container WHERE database_id = ? AND remote_id = ? LIMIT 1"
        ))
        .bind(database_id)
        .bind(remote_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Container::from))
    }

    pub fn stream_non_base<'e, E>(
        &self,
        executor: E,
        database_id: i64,
    ) -> impl Stream<Item = Result<Container, CatalogError>> + 'e
    where
        E: Executor<'e, Database = Sqlite> + 'e,
    {
        sqlx::query_as::<_, DbContainer>(&format!(
            "SELECT {COLUMNS} FROM container WHERE database_id = ? AND is_base = 0"
        ))
        .bind(database_id)
        .fetch(executor)
        .map(|r| r.map(Container::from).map_err(CatalogError::from_sqlx_error))
    }

    /// Upsert the synthetic base container for a database (`is_base = true`,
    /// `remote_id = NULL`).
    pub async fn upsert_base(
        &self,
        conn: &mut SqliteConnection,
        database_id: i64,
        name: &str,
        checksum: u32,
        persistent_id: i64,
    ) -> Result<(Container, UpsertOutcome), CatalogError> {
        let existing = self.base_container(&mut *conn, database_id).await?;

        match existing {
            Some(existing) if existing.checksum == checksum => Ok((existing, UpsertOutcome::Unchanged)),
            Some(existing) => {
                sqlx::query("UPDATE container SET name = ?, checksum = ? WHERE id = ?")
                    .bind(name)
                    .bind(checksum as i64)
                    .bind(existing.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(CatalogError::from_sqlx_error)?;

                Ok((
                    Container {
                        name: name.to_string(),
                        checksum,
                        ..existing
                    },
                    UpsertOutcome::Updated,
                ))
            }
            None => {
                let row = sqlx::query_as::<_, DbContainer>(&format!(
                    "INSERT INTO container (persistent_id, database_id, parent_id, name, \
                     is_base, is_smart, exclude, cache, checksum, remote_id)
                     VALUES (?, ?, NULL, ?, 1, 0, 0, 0, ?, NULL)
                     RETURNING {COLUMNS}"
                ))
                .bind(persistent_id)
                .bind(database_id)
                .bind(name)
                .bind(checksum as i64)
                .fetch_one(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((Container::from(row), UpsertOutcome::Inserted))
            }
        }
    }

    /// Upsert a non-base, non-smart playlist container by remote id.
    pub async fn upsert_playlist(
        &self,
        conn: &mut SqliteConnection,
        database_id: i64,
        name: &str,
        remote_id: i64,
        checksum: u32,
        persistent_id: i64,
    ) -> Result<(Container, UpsertOutcome), CatalogError> {
        let existing = self.by_remote_id(&mut *conn, database_id, remote_id).await?;

        match existing {
            Some(existing) if existing.checksum == checksum => Ok((existing, UpsertOutcome::Unchanged)),
            Some(existing) => {
                sqlx::query("UPDATE container SET name = ?, checksum = ? WHERE id = ?")
                    .bind(name)
                    .bind(checksum as i64)
                    .bind(existing.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(CatalogError::from_sqlx_error)?;

                Ok((
                    Container {
                        name: name.to_string(),
                        checksum,
                        ..existing
                    },
                    UpsertOutcome::Updated,
                ))
            }
            None => {
                let row = sqlx::query_as::<_, DbContainer>(&format!(
                    "INSERT INTO container (persistent_id, database_id, parent_id, name, \
                     is_base, is_smart, exclude, cache, checksum, remote_id)
                     VALUES (?, ?, NULL, ?, 0, 0, 0, 0, ?, ?)
                     RETURNING {COLUMNS}"
                ))
                .bind(persistent_id)
                .bind(database_id)
                .bind(name)
                .bind(checksum as i64)
                .bind(remote_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((Container::from(row), UpsertOutcome::Inserted))
            }
        }
    }

    pub async fn delete<'e, E>(&self, executor: E, id: i64) -> Result<(), CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM container WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(())
    }
}

impl Default for ContainersRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;
    use futures::TryStreamExt;

    async fn seed_database(store: &CatalogStore) {
        sqlx::query(
            "INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id) VALUES (1, 'db', 0, 0, 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn upsert_base_is_idempotent_until_checksum_changes() {
        let store = CatalogStore::in_memory().await.unwrap();
        seed_database(&store).await;
        let repo = ContainersRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();

        let (base, outcome) = repo.upsert_base(&mut conn, 1, "All Items", 111, 1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert!(base.is_base);
        assert!(base.remote_id.is_none());

        let (_, outcome) = repo.upsert_base(&mut conn, 1, "All Items", 111, 1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let (updated, outcome) = repo.upsert_base(&mut conn, 1, "All Items", 222, 1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(updated.id, base.id);
    }

    #[tokio::test]
    async fn upsert_playlist_inserts_then_updates_by_remote_id() {
        let store = CatalogStore::in_memory().await.unwrap();
        seed_database(&store).await;
        let repo = ContainersRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();

        let (playlist, outcome) = repo
            .upsert_playlist(&mut conn, 1, "Favorites", 9, 111, 2)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert!(!playlist.is_base);
        assert_eq!(playlist.remote_id, Some(9));

        let (updated, outcome) = repo
            .upsert_playlist(&mut conn, 1, "Favorites (renamed)", 9, 222, 2)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(updated.id, playlist.id);
        assert_eq!(updated.name, "Favorites (renamed)");
    }

    #[tokio::test]
    async fn stream_non_base_excludes_the_base_container() {
        let store = CatalogStore::in_memory().await.unwrap();
        seed_database(&store).await;
        let repo = ContainersRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();

        repo.upsert_base(&mut conn, 1, "All Items", 1, 1).await.unwrap();
        repo.upsert_playlist(&mut conn, 1, "Favorites", 9, 1, 2).await.unwrap();

        let non_base: Vec<Container> =
            repo.stream_non_base(store.pool(), 1).try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(non_base.len(), 1);
        assert_eq!(non_base[0].name, "Favorites");
    }
}
