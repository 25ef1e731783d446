//! Transactional relational storage of the mirrored library.

pub mod albums;
pub mod artists;
pub mod container_items;
pub mod containers;
pub mod databases;
pub mod entities;
pub mod items;

pub use entities::{Album, Artist, Container, ContainerItem, Database, Item};

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("row not found")]
    RowNotFound,

    #[error("a constraint was violated: {description}")]
    Conflict { description: String },

    #[error("catalog storage error: {0}")]
    Io(#[from] sqlx::Error),

    #[error("failed to decode row: {0}")]
    RowDecoding(String),
}

impl CatalogError {
    pub fn from_sqlx_error(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Decode(decode_err) => Self::RowDecoding(decode_err.to_string()),
            sqlx::Error::Database(db_error) => {
                if let Some(code) = db_error.code() {
                    // SQLite constraint codes: 19 generic, 2067 unique, 1555
                    // primary key, 787 foreign key.
                    if ["19", "2067", "1555", "787"].contains(&code.as_ref()) {
                        return Self::Conflict {
                            description: db_error.message().to_string(),
                        };
                    }
                }

                Self::Io(err)
            }
            _ => Self::Io(err),
        }
    }
}

/// Owns the single SQLite file backing the catalog mirror for every
/// configured origin, plus the process-wide writer lock that serializes
/// synchronizer passes.
pub struct CatalogStore {
    pool: SqlitePool,
    writer_lock: Arc<Mutex<()>>,
}

/// A serialized write transaction. Dropping without `commit` rolls back.
pub struct WriteCursor {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteCursor {
    pub fn as_mut(&mut self) -> &mut Transaction<'static, Sqlite> {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), CatalogError> {
        self.tx.commit().await.map_err(CatalogError::from_sqlx_error)
    }

    pub async fn rollback(self) -> Result<(), CatalogError> {
        self.tx.rollback().await.map_err(CatalogError::from_sqlx_error)
    }
}

impl CatalogStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        let store = Self {
            pool,
            writer_lock: Arc::new(Mutex::new(())),
        };

        store.create_schema(false).await?;

        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, CatalogError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect("sqlite::memory:")
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        let store = Self {
            pool,
            writer_lock: Arc::new(Mutex::new(())),
        };

        store.create_schema(false).await?;

        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the process-wide writer lock and begin a transaction. Every
    /// synchronizer pass runs entirely inside one `WriteCursor`.
    pub async fn begin_write(&self) -> Result<WriteCursor, CatalogError> {
        let guard = self.writer_lock.clone().lock_owned().await;
        let tx = self
            .pool
            .begin()
            .await
            .map_err(CatalogError::from_sqlx_error)?;

        Ok(WriteCursor { tx, _guard: guard })
    }

    /// Idempotent schema creation (`CREATE TABLE IF NOT EXISTS`), optionally
    /// preceded by a destructive drop of every table in FK-safe order.
    pub async fn create_schema(&self, drop_existing: bool) -> Result<(), CatalogError> {
        if drop_existing {
            for table in [
                "container_item",
                "container",
                "item",
                "album",
                "artist",
                "database",
            ] {
                sqlx::query(&format!("DROP TABLE IF EXISTS `{table}`"))
                    .execute(&self.pool)
                    .await
                    .map_err(CatalogError::from_sqlx_error)?;
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `database` (
                `id` INTEGER PRIMARY KEY AUTOINCREMENT,
                `persistent_id` INTEGER NOT NULL UNIQUE,
                `name` TEXT NOT NULL,
                `exclude` INTEGER NOT NULL DEFAULT 0,
                `checksum` INTEGER NOT NULL,
                `remote_id` INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `artist` (
                `id` INTEGER PRIMARY KEY AUTOINCREMENT,
                `database_id` INTEGER NOT NULL REFERENCES `database`(`id`),
                `name` TEXT NOT NULL,
                `exclude` INTEGER NOT NULL DEFAULT 0,
                `checksum` INTEGER NOT NULL,
                `remote_id` INTEGER,
                UNIQUE(`database_id`, `remote_id`),
                UNIQUE(`database_id`, `name`, `remote_id`)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `album` (
                `id` INTEGER PRIMARY KEY AUTOINCREMENT,
                `database_id` INTEGER NOT NULL REFERENCES `database`(`id`),
                `artist_id` INTEGER NOT NULL REFERENCES `artist`(`id`),
                `name` TEXT NOT NULL,
                `art` INTEGER NOT NULL DEFAULT 0,
                `checksum` INTEGER NOT NULL,
                `remote_id` INTEGER NOT NULL,
                UNIQUE(`database_id`, `remote_id`)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `item` (
                `id` INTEGER PRIMARY KEY AUTOINCREMENT,
                `persistent_id` INTEGER NOT NULL UNIQUE,
                `database_id` INTEGER NOT NULL REFERENCES `database`(`id`),
                `artist_id` INTEGER REFERENCES `artist`(`id`),
                `album_artist_id` INTEGER REFERENCES `artist`(`id`),
                `album_id` INTEGER REFERENCES `album`(`id`),
                `name` TEXT NOT NULL,
                `genre` TEXT,
                `year` INTEGER,
                `track` INTEGER,
                `duration` INTEGER NOT NULL,
                `bitrate` INTEGER,
                `file_name` TEXT NOT NULL,
                `file_type` TEXT NOT NULL,
                `file_suffix` TEXT NOT NULL,
                `file_size` INTEGER NOT NULL,
                `exclude` INTEGER NOT NULL DEFAULT 0,
                `cache` INTEGER NOT NULL DEFAULT 0,
                `checksum` INTEGER NOT NULL,
                `remote_id` INTEGER NOT NULL,
                UNIQUE(`database_id`, `remote_id`)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `container` (
                `id` INTEGER PRIMARY KEY AUTOINCREMENT,
                `persistent_id` INTEGER NOT NULL UNIQUE,
                `database_id` INTEGER NOT NULL REFERENCES `database`(`id`),
                `parent_id` INTEGER REFERENCES `container`(`id`),
                `name` TEXT NOT NULL,
                `is_base` INTEGER NOT NULL DEFAULT 0,
                `is_smart` INTEGER NOT NULL DEFAULT 0,
                `exclude` INTEGER NOT NULL DEFAULT 0,
                `cache` INTEGER NOT NULL DEFAULT 0,
                `checksum` INTEGER NOT NULL,
                `remote_id` INTEGER,
                UNIQUE(`database_id`, `remote_id`)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `container_item` (
                `id` INTEGER PRIMARY KEY AUTOINCREMENT,
                `database_id` INTEGER NOT NULL REFERENCES `database`(`id`),
                `container_id` INTEGER NOT NULL REFERENCES `container`(`id`),
                `item_id` INTEGER NOT NULL REFERENCES `item`(`id`),
                `order` INTEGER,
                UNIQUE(`container_id`, `item_id`)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(CatalogError::from_sqlx_error)?;

        Ok(())
    }
}
