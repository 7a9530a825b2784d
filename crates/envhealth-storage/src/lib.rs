//! Relational store for regions, observations, health records and ingestion cursors.
//!
//! Backed by SQLite through `sqlx`. The pool is capped at a single connection so every
//! call takes a short exclusive connection, runs its statements in one transaction and
//! hands the connection back; foreign keys are enforced on every connection.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use envhealth_core::RegionId;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

mod cursor;
mod query;
mod resolver;
mod schema;
mod writer;

pub use cursor::{plan_batch, Batch, CursorPlan, CursorWalk, UNCONSUMED};
pub use query::{AirQualityRow, HealthRow, TableCounts, WeatherRow};
pub use schema::{
    adopt_unversioned_store, Adoption, AppliedMigration, Migration, Probe, SchemaReport, Step, MIGRATIONS,
    SCHEMA_VERSION,
};

pub const CRATE_NAME: &str = "envhealth-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("region needs a non-empty name and parent region (got {name:?}, {parent_region:?})")]
    InvalidRegion {
        name: String,
        parent_region: String,
    },
    #[error("region code {code} already belongs to region {owner}")]
    CodeConflict { code: String, owner: RegionId },
    #[error("region {0} does not exist")]
    UnknownRegion(RegionId),
    #[error("integrity violation writing {table}: {message}")]
    Integrity {
        table: &'static str,
        message: String,
    },
    #[error("store schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Constraint violations that only affect the record being written.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::InvalidRegion { .. }
                | Self::CodeConflict { .. }
                | Self::UnknownRegion(_)
                | Self::Integrity { .. }
        )
    }
}

pub(crate) fn constraint_kind(err: &sqlx::Error) -> Option<ErrorKind> {
    match err {
        sqlx::Error::Database(db_err) => Some(db_err.kind()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// Open a private in-memory database. Contents live as long as the returned store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub async fn migrated_store() -> (TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("test.db"))
            .await
            .expect("open store");
        store.ensure_schema().await.expect("ensure schema");
        (dir, store)
    }
}
