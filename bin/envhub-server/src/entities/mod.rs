//! Database layer.
//!
//! [`ImageStore`] defines the interface for persisting build records; the
//! implementation is [`SqliteStore`]. All trait methods use `impl Future` in
//! their signatures so no extra `async-trait` crate is required.
//!
//! # Migrations
//!
//! `sqlx::migrate!("./migrations")` resolves the path at compile time relative
//! to the crate root, so the directory is embedded into the binary. The
//! service never migrates an existing database implicitly: a fresh database is
//! initialised to the latest schema, an outdated one is refused until
//! `envhub-server upgrade-db` has been run.

pub mod dao;
pub mod image;

pub use dao::ImageRecord;
pub use image::ImageStore;

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] MigrateError),

    #[error(
        "Found database schema version {found} != {expected}. Backup your database and run \
         `envhub-server upgrade-db` to upgrade to the latest schema."
    )]
    SchemaMismatch { found: i64, expected: i64 },
}

/// SQLite-backed build record store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database at `url` without touching its schema.
    ///
    /// In-memory databases get a single, never-recycled connection so every
    /// query sees the same data.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };
        Ok(Self { pool })
    }

    /// Open the database and make sure its schema is current.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let store = Self::open(url).await?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Apply every pending migration.
    pub async fn upgrade(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Latest migration version embedded in this binary.
    pub fn head_version() -> i64 {
        MIGRATOR.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Latest successfully applied migration, `None` for a fresh database.
    pub async fn applied_version(&self) -> Result<Option<i64>, StoreError> {
        let tracked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
        )
        .fetch_one(&self.pool)
        .await?;
        if tracked == 0 {
            return Ok(None);
        }
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let expected = Self::head_version();
        match self.applied_version().await? {
            None => {
                info!(version = expected, "initialising database schema");
                self.upgrade().await
            }
            Some(found) if found == expected => Ok(()),
            Some(found) => Err(StoreError::SchemaMismatch { found, expected }),
        }
    }

    #[cfg(test)]
    pub async fn memory() -> Self {
        Self::connect("sqlite::memory:")
            .await
            .expect("in-memory database")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fresh_database_is_initialised_to_head() {
        let store = SqliteStore::memory().await;
        assert_eq!(
            store.applied_version().await.unwrap(),
            Some(SqliteStore::head_version())
        );
    }

    #[tokio::test]
    async fn outdated_schema_is_refused() {
        let store = SqliteStore::memory().await;
        sqlx::query("UPDATE _sqlx_migrations SET version = 1")
            .execute(&store.pool)
            .await
            .unwrap();
        let err = store.ensure_schema().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Found database schema version 1"));
        assert!(message.contains("upgrade-db"));
    }
}
