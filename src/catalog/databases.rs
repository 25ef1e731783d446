use sqlx::{Executor, FromRow, Sqlite, SqliteConnection};

use super::entities::Database;
use super::CatalogError;
use crate::catalog::artists::UpsertOutcome;

#[derive(FromRow)]
struct DbDatabase {
    id: i64,
    persistent_id: i64,
    name: String,
    exclude: bool,
    checksum: i64,
    remote_id: Option<i64>,
}

impl From<DbDatabase> for Database {
    fn from(row: DbDatabase) -> Self {
        Self {
            id: row.id,
            persistent_id: row.persistent_id,
            name: row.name,
            exclude: row.exclude,
            checksum: row.checksum as u32,
            remote_id: row.remote_id,
        }
    }
}

const COLUMNS: &str = "id, persistent_id, name, exclude, checksum, remote_id";

pub struct DatabasesRepository;

impl DatabasesRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn by_remote_id<'e, E>(
        &self,
        executor: E,
        remote_id: i64,
    ) -> Result<Option<Database>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbDatabase>(&format!(
            "SELECT {COLUMNS} FROM `database` WHERE remote_id = ? LIMIT 1"
        ))
        .bind(remote_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(Database::from))
    }

    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        remote_id: i64,
        checksum: u32,
        persistent_id: i64,
    ) -> Result<(Database, UpsertOutcome), CatalogError> {
        let existing = self.by_remote_id(&mut *conn, remote_id).await?;

        match existing {
            Some(existing) if existing.checksum == checksum => Ok((existing, UpsertOutcome::Unchanged)),
            Some(existing) => {
                sqlx::query("UPDATE `database` SET name = ?, checksum = ? WHERE id = ?")
                    .bind(name)
                    .bind(checksum as i64)
                    .bind(existing.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(CatalogError::from_sqlx_error)?;

                Ok((
                    Database {
                        name: name.to_string(),
                        checksum,
                        ..existing
                    },
                    UpsertOutcome::Updated,
                ))
            }
            None => {
                let row = sqlx::query_as::<_, DbDatabase>(&format!(
                    "INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id)
                     VALUES (?, ?, 0, ?, ?)
                     RETURNING {COLUMNS}"
                ))
                .bind(persistent_id)
                .bind(name)
                .bind(checksum as i64)
                .bind(remote_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(CatalogError::from_sqlx_error)?;

                Ok((Database::from(row), UpsertOutcome::Inserted))
            }
        }
    }
}

impl Default for DatabasesRepository {
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
        let repo = DatabasesRepository::new();
        let mut conn = store.pool().acquire().await.unwrap();

        let (database, outcome) = repo.upsert(&mut conn, "Music", 1, 111, 1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let (_, outcome) = repo.upsert(&mut conn, "Music", 1, 111, 1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let (updated, outcome) = repo.upsert(&mut conn, "Music Library", 1, 222, 1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(updated.id, database.id);
        assert_eq!(updated.name, "Music Library");
    }

    #[tokio::test]
    async fn by_remote_id_misses_for_unknown_origin() {
        let store = CatalogStore::in_memory().await.unwrap();
        let repo = DatabasesRepository::new();
        assert!(repo.by_remote_id(store.pool(), 404).await.unwrap().is_none());
    }
}
