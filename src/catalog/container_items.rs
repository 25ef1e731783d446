use futures::{Stream, StreamExt};
use sqlx::{Executor, FromRow, Sqlite};

use super::entities::ContainerItem;
use super::CatalogError;

#[derive(FromRow)]
struct DbContainerItem {
    id: i64,
    database_id: i64,
    container_id: i64,
    item_id: i64,
    order: Option<i64>,
}

impl From<DbContainerItem> for ContainerItem {
    fn from(row: DbContainerItem) -> Self {
        Self {
            id: row.id,
            database_id: row.database_id,
            container_id: row.container_id,
            item_id: row.item_id,
            order: row.order,
        }
    }
}

const COLUMNS: &str = "id, database_id, container_id, item_id, `order`";

pub struct ContainerItemsRepository;

impl ContainerItemsRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn by_item_id<'e, E>(
        &self,
        executor: E,
        container_id: i64,
        item_id: i64,
    ) -> Result<Option<ContainerItem>, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbContainerItem>(&format!(
            "SELECT {COLUMNS} FROM container_item WHERE container_id = ? AND item_id = ? LIMIT 1"
        ))
        .bind(container_id)
        .bind(item_id)
        .fetch_optional(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(row.map(ContainerItem::from))
    }

    pub fn stream_by_container<'e, E>(
        &self,
        executor: E,
        container_id: i64,
    ) -> impl Stream<Item = Result<ContainerItem, CatalogError>> + 'e
    where
        E: Executor<'e, Database = Sqlite> + 'e,
    {
        sqlx::query_as::<_, DbContainerItem>(&format!(
            "SELECT {COLUMNS} FROM container_item WHERE container_id = ? ORDER BY `order` ASC"
        ))
        .bind(container_id)
        .fetch(executor)
        .map(|r| r.map(ContainerItem::from).map_err(CatalogError::from_sqlx_error))
    }

    /// Ensure a `(container_id, item_id)` row exists; used for the base
    /// container's mirror of every item.
    pub async fn ensure<'e, E>(
        &self,
        executor: E,
        database_id: i64,
        container_id: i64,
        item_id: i64,
        order: Option<i64>,
    ) -> Result<ContainerItem, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, DbContainerItem>(&format!(
            "INSERT INTO container_item (database_id, container_id, item_id, `order`)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(container_id, item_id) DO UPDATE SET `order` = excluded.`order`
             RETURNING {COLUMNS}"
        ))
        .bind(database_id)
        .bind(container_id)
        .bind(item_id)
        .bind(order)
        .fetch_one(executor)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(ContainerItem::from(row))
    }

    /// Delete every row for a container, used when re-materializing a
    /// playlist whose checksum changed.
    pub async fn delete_all_for_container<'e, E>(
        &self,
        executor: E,
        container_id: i64,
    ) -> Result<u64, CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM container_item WHERE container_id = ?")
            .bind(container_id)
            .execute(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(result.rows_affected())
    }

    pub async fn delete<'e, E>(&self, executor: E, id: i64) -> Result<(), CatalogError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM container_item WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(())
    }
}

impl Default for ContainerItemsRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;
    use futures::TryStreamExt;

    async fn seed_database_container_and_item(store: &CatalogStore) -> (i64, i64, i64) {
        sqlx::query(
            "INSERT INTO `database` (persistent_id, name, exclude, checksum, remote_id) VALUES (1, 'db', 0, 0, 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let (container_id,): (i64,) = sqlx::query_as(
            "INSERT INTO container (persistent_id, database_id, name, is_base, is_smart, checksum) \
             VALUES (1, 1, 'All Items', 1, 0, 0) RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();

        let (item_id,): (i64,) = sqlx::query_as(
            "INSERT INTO item (persistent_id, database_id, name, duration, file_name, file_type, \
             file_suffix, file_size, checksum, remote_id) \
             VALUES (1, 1, 'Track', 1000, 'track.mp3', 'audio/mpeg', 'mp3', 4, 0, 7) RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();

        (1, container_id, item_id)
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_updates_order() {
        let store = CatalogStore::in_memory().await.unwrap();
        let (database_id, container_id, item_id) = seed_database_container_and_item(&store).await;

        let repo = ContainerItemsRepository::new();
        let first = repo.ensure(store.pool(), database_id, container_id, item_id, Some(1)).await.unwrap();
        let second = repo.ensure(store.pool(), database_id, container_id, item_id, Some(2)).await.unwrap();

        assert_eq!(first.id, second.id, "ensure must reuse the existing row");
        assert_eq!(second.order, Some(2));
    }

    #[tokio::test]
    async fn delete_all_for_container_clears_every_row() {
        let store = CatalogStore::in_memory().await.unwrap();
        let (database_id, container_id, item_id) = seed_database_container_and_item(&store).await;

        let repo = ContainerItemsRepository::new();
        repo.ensure(store.pool(), database_id, container_id, item_id, Some(1)).await.unwrap();

        let removed = repo.delete_all_for_container(store.pool(), container_id).await.unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<ContainerItem> =
            repo.stream_by_container(store.pool(), container_id).try_collect::<Vec<_>>().await.unwrap();
        assert!(remaining.is_empty());
    }
}
