use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, Sqlite, Transaction};
use tracing::{info, warn};

use crate::{Store, StoreError};

/// Latest schema version this build knows how to produce.
pub const SCHEMA_VERSION: i64 = 7;

const SCHEMA_MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    destructive INTEGER NOT NULL CHECK (destructive IN (0, 1)),
    adopted INTEGER NOT NULL DEFAULT 0 CHECK (adopted IN (0, 1)),
    applied_at TEXT NOT NULL
)
"#;

/// One unit of schema change inside a migration.
#[derive(Debug)]
pub enum Step {
    /// Additive DDL, written to be a no-op when the object already exists.
    Sql(&'static str),
    /// `ALTER TABLE .. ADD COLUMN`, then copy values over from `backfill_from` when the
    /// store still carries that legacy column.
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
        backfill_from: Option<&'static str>,
    },
    /// Drop `table` and create it again, empty, from `create_sql`. Destructive when the
    /// dropped table held rows.
    RecreateTable {
        table: &'static str,
        create_sql: &'static str,
    },
}

/// Shape check used only when adopting a store that predates the migration ledger.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub table: &'static str,
    pub column: Option<&'static str>,
    /// Drop the table during adoption when it exists but lacks `column`, so the migration
    /// can create it in the current shape.
    pub recreate_on_mismatch: bool,
}

#[derive(Debug)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub steps: &'static [Step],
    pub probe: Probe,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_regions",
        steps: &[Step::Sql(
            r#"
CREATE TABLE IF NOT EXISTS regions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    parent_region TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    UNIQUE (name, parent_region)
)
"#,
        )],
        probe: Probe {
            table: "regions",
            column: None,
            recreate_on_mismatch: false,
        },
    },
    Migration {
        version: 2,
        name: "create_air_quality",
        steps: &[Step::Sql(
            r#"
CREATE TABLE IF NOT EXISTS air_quality (
    id INTEGER PRIMARY KEY,
    region_id INTEGER NOT NULL REFERENCES regions(id),
    aqi INTEGER,
    pm25 REAL,
    pm10 REAL,
    co REAL,
    no2 REAL,
    so2 REAL,
    o3 REAL,
    observed_at INTEGER NOT NULL,
    ingested_at TEXT NOT NULL,
    UNIQUE (region_id, observed_at)
)
"#,
        )],
        probe: Probe {
            table: "air_quality",
            column: Some("region_id"),
            recreate_on_mismatch: true,
        },
    },
    Migration {
        version: 3,
        name: "create_weather",
        steps: &[
            Step::Sql(
                r#"
CREATE TABLE IF NOT EXISTS weather_conditions (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL UNIQUE
)
"#,
            ),
            Step::Sql(
                r#"
CREATE TABLE IF NOT EXISTS weather (
    id INTEGER PRIMARY KEY,
    region_id INTEGER NOT NULL REFERENCES regions(id),
    temperature REAL,
    humidity REAL,
    wind_speed REAL,
    pressure REAL,
    condition_id INTEGER REFERENCES weather_conditions(id),
    observed_at INTEGER NOT NULL,
    ingested_at TEXT NOT NULL,
    UNIQUE (region_id, observed_at)
)
"#,
            ),
        ],
        probe: Probe {
            table: "weather",
            column: Some("region_id"),
            recreate_on_mismatch: true,
        },
    },
    Migration {
        version: 4,
        name: "create_health_records_by_area",
        steps: &[Step::Sql(
            r#"
CREATE TABLE IF NOT EXISTS health_records (
    id INTEGER PRIMARY KEY,
    area TEXT NOT NULL,
    asthma_rate REAL,
    year INTEGER
)
"#,
        )],
        probe: Probe {
            table: "health_records",
            column: None,
            recreate_on_mismatch: false,
        },
    },
    Migration {
        version: 5,
        name: "create_ingestion_cursors",
        steps: &[Step::Sql(
            r#"
CREATE TABLE IF NOT EXISTS ingestion_cursors (
    source TEXT PRIMARY KEY,
    last_index INTEGER NOT NULL,
    updated_at TEXT NOT NULL
)
"#,
        )],
        probe: Probe {
            table: "ingestion_cursors",
            column: None,
            recreate_on_mismatch: false,
        },
    },
    Migration {
        version: 6,
        name: "regions_add_code",
        steps: &[
            Step::AddColumn {
                table: "regions",
                column: "code",
                decl: "TEXT",
                backfill_from: Some("fips"),
            },
            Step::Sql("CREATE UNIQUE INDEX IF NOT EXISTS ux_regions_code ON regions(code)"),
        ],
        probe: Probe {
            table: "regions",
            column: Some("code"),
            recreate_on_mismatch: false,
        },
    },
    Migration {
        version: 7,
        name: "health_records_by_region",
        steps: &[Step::RecreateTable {
            table: "health_records",
            create_sql: r#"
CREATE TABLE health_records (
    id INTEGER PRIMARY KEY,
    region_id INTEGER NOT NULL REFERENCES regions(id),
    gender TEXT NOT NULL,
    year INTEGER NOT NULL,
    rate REAL NOT NULL,
    lower_ci REAL,
    upper_ci REAL,
    visits INTEGER NOT NULL DEFAULT 0,
    ingested_at TEXT NOT NULL,
    UNIQUE (region_id, gender, year)
)
"#,
        }],
        probe: Probe {
            table: "health_records",
            column: Some("region_id"),
            recreate_on_mismatch: false,
        },
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: &'static str,
    /// Rows were lost to a table recreate.
    pub destructive: bool,
    pub dropped_rows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    /// Migrations executed by this call, in order.
    pub applied: Vec<AppliedMigration>,
    /// Versions recorded as already satisfied by an unversioned store.
    pub adopted: Vec<i64>,
    /// Tables dropped during adoption because their shape could not be migrated.
    pub recreated_on_adoption: Vec<&'static str>,
    pub version: i64,
}

impl SchemaReport {
    pub fn destructive_changes(&self) -> usize {
        self.applied.iter().filter(|m| m.destructive).count() + self.recreated_on_adoption.len()
    }
}

impl Store {
    /// Bring the store up to [`SCHEMA_VERSION`]. Safe to call on every run.
    pub async fn ensure_schema(&self) -> Result<SchemaReport, StoreError> {
        let mut report = SchemaReport::default();
        let mut conn = self.pool.acquire().await?;

        if !table_exists(&mut conn, "schema_migrations").await?
            && table_exists(&mut conn, "regions").await?
        {
            let adoption = adopt_unversioned_store(&mut conn).await?;
            report.adopted = adoption.adopted;
            report.recreated_on_adoption = adoption.recreated;
        }

        sqlx::query(SCHEMA_MIGRATIONS_TABLE_SQL)
            .execute(&mut *conn)
            .await?;

        let applied_versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&mut *conn)
                .await?;
        if let Some(&found) = applied_versions.last() {
            if found > SCHEMA_VERSION {
                return Err(StoreError::UnsupportedSchema {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }
        drop(conn);

        for migration in MIGRATIONS {
            if applied_versions.contains(&migration.version) {
                continue;
            }
            let dropped_rows = self.apply_migration(migration).await?;
            report.applied.push(AppliedMigration {
                version: migration.version,
                name: migration.name,
                destructive: dropped_rows > 0,
                dropped_rows,
            });
        }

        report.version = self.schema_version().await?;
        Ok(report)
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Apply one migration in its own transaction and return how many rows it dropped.
    async fn apply_migration(&self, migration: &Migration) -> Result<u64, StoreError> {
        let wrap = |source: sqlx::Error| StoreError::Migration {
            version: migration.version,
            name: migration.name,
            source,
        };

        let mut tx = self.pool.begin().await.map_err(wrap)?;
        let mut dropped_rows = 0u64;
        for step in migration.steps {
            dropped_rows += run_step(&mut tx, migration, step).await.map_err(wrap)?;
        }
        let destructive = dropped_rows > 0;
        sqlx::query(
            "INSERT INTO schema_migrations (version, name, destructive, adopted, applied_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
        )
        .bind(migration.version)
        .bind(migration.name)
        .bind(destructive)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;

        if destructive {
            warn!(
                version = migration.version,
                name = migration.name,
                dropped_rows,
                destructive = true,
                "applied destructive schema migration; affected tables were recreated empty"
            );
        } else {
            info!(
                version = migration.version,
                name = migration.name,
                destructive = false,
                "applied schema migration"
            );
        }
        Ok(dropped_rows)
    }
}

async fn run_step(
    tx: &mut Transaction<'_, Sqlite>,
    migration: &Migration,
    step: &Step,
) -> Result<u64, sqlx::Error> {
    let mut dropped_rows = 0u64;
    match step {
        Step::Sql(sql) => {
            sqlx::query(sql).execute(&mut **tx).await?;
        }
        Step::AddColumn {
            table,
            column,
            decl,
            backfill_from,
        } => {
            let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
            sqlx::query(&alter).execute(&mut **tx).await?;
            if let Some(legacy) = backfill_from {
                if table_has_column(&mut **tx, table, legacy).await? {
                    let backfill = format!(
                        "UPDATE {table} SET {column} = {legacy} WHERE {column} IS NULL AND {legacy} IS NOT NULL"
                    );
                    let result = sqlx::query(&backfill).execute(&mut **tx).await?;
                    info!(
                        version = migration.version,
                        table,
                        column,
                        legacy,
                        rows = result.rows_affected(),
                        "backfilled column from legacy equivalent"
                    );
                }
            }
        }
        Step::RecreateTable { table, create_sql } => {
            let dropped: i64 = if table_exists(&mut **tx, table).await? {
                let count = format!("SELECT COUNT(*) FROM {table}");
                sqlx::query_scalar(&count).fetch_one(&mut **tx).await?
            } else {
                0
            };
            let drop_sql = format!("DROP TABLE IF EXISTS {table}");
            sqlx::query(&drop_sql).execute(&mut **tx).await?;
            sqlx::query(create_sql).execute(&mut **tx).await?;
            dropped_rows = u64::try_from(dropped).unwrap_or(0);
            if dropped_rows > 0 {
                warn!(
                    version = migration.version,
                    table,
                    dropped_rows,
                    destructive = true,
                    "recreated table empty"
                );
            } else {
                info!(version = migration.version, table, "recreated empty table in current shape");
            }
        }
    }
    Ok(dropped_rows)
}

#[derive(Debug, Default)]
pub struct Adoption {
    pub adopted: Vec<i64>,
    pub recreated: Vec<&'static str>,
}

/// One-time compatibility shim for stores created before the migration ledger existed.
///
/// Each migration's [`Probe`] is checked against the live tables; satisfied migrations are
/// recorded as adopted so [`Store::ensure_schema`] skips them. Tables whose shape cannot be
/// migrated in place are dropped so their creating migration runs fresh. This is the only
/// code that inspects column layout to decide what to do.
pub async fn adopt_unversioned_store(
    conn: &mut SqliteConnection,
) -> Result<Adoption, StoreError> {
    let mut adoption = Adoption::default();
    sqlx::query(SCHEMA_MIGRATIONS_TABLE_SQL)
        .execute(&mut *conn)
        .await?;

    for migration in MIGRATIONS {
        let probe = migration.probe;
        if !table_exists(&mut *conn, probe.table).await? {
            continue;
        }
        let satisfied = match probe.column {
            None => true,
            Some(column) => table_has_column(&mut *conn, probe.table, column).await?,
        };

        if satisfied {
            sqlx::query(
                "INSERT OR IGNORE INTO schema_migrations (version, name, destructive, adopted, applied_at)
                 VALUES (?1, ?2, 0, 1, ?3)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
            adoption.adopted.push(migration.version);
            info!(
                version = migration.version,
                name = migration.name,
                "adopted existing table shape"
            );
        } else if probe.recreate_on_mismatch {
            let drop_sql = format!("DROP TABLE IF EXISTS {}", probe.table);
            sqlx::query(&drop_sql).execute(&mut *conn).await?;
            adoption.recreated.push(probe.table);
            warn!(
                table = probe.table,
                missing_column = probe.column,
                destructive = true,
                "dropping unversioned table with incompatible shape; it will be recreated empty"
            );
        }
    }

    Ok(adoption)
}

pub(crate) async fn table_exists(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(conn)
            .await?;
    Ok(count > 0)
}

pub(crate) async fn table_has_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")
            .bind(table)
            .bind(column)
            .fetch_one(conn)
            .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_store;

    #[test]
    fn migration_versions_are_strictly_increasing() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last().copied(), Some(SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn fresh_store_applies_every_migration_once() {
        let (_dir, store) = migrated_store().await;
        assert_eq!(store.schema_version().await.expect("version"), SCHEMA_VERSION);

        let second = store.ensure_schema().await.expect("second run");
        assert!(second.applied.is_empty());
        assert!(second.adopted.is_empty());
        assert_eq!(second.version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn fresh_store_reports_no_destructive_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("fresh.db")).await.expect("open");
        let report = store.ensure_schema().await.expect("schema");

        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.destructive_changes(), 0);
        assert!(report.applied.iter().all(|m| m.dropped_rows == 0));

        let flagged: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations WHERE destructive = 1")
                .fetch_one(store.pool())
                .await
                .expect("ledger");
        assert_eq!(flagged, 0);
    }

    #[tokio::test]
    async fn recreate_that_drops_rows_is_flagged_in_ledger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("ledger.db")).await.expect("open");

        // Area-keyed health table from builds that predate the migration ledger.
        for sql in [
            "CREATE TABLE regions (id INTEGER PRIMARY KEY, name TEXT NOT NULL, parent_region TEXT NOT NULL, fips TEXT, latitude REAL, longitude REAL, UNIQUE (name, parent_region))",
            "CREATE TABLE health_records (id INTEGER PRIMARY KEY, area TEXT NOT NULL, asthma_rate REAL, year INTEGER)",
            "INSERT INTO health_records (area, asthma_rate, year) VALUES ('Adams', 51.2, 2020)",
            "INSERT INTO health_records (area, asthma_rate, year) VALUES ('Denver', 58.9, 2020)",
        ] {
            sqlx::query(sql).execute(store.pool()).await.expect("legacy ddl");
        }

        let report = store.ensure_schema().await.expect("schema");
        assert_eq!(report.adopted, vec![1, 4]);
        let destructive: Vec<(i64, u64)> = report
            .applied
            .iter()
            .filter(|m| m.destructive)
            .map(|m| (m.version, m.dropped_rows))
            .collect();
        assert_eq!(destructive, vec![(7, 2)]);
        assert_eq!(report.destructive_changes(), 1);

        let flagged: Vec<i64> = sqlx::query_scalar(
            "SELECT version FROM schema_migrations WHERE destructive = 1 ORDER BY version",
        )
        .fetch_all(store.pool())
        .await
        .expect("ledger");
        assert_eq!(flagged, vec![7]);
    }

    #[tokio::test]
    async fn ensure_schema_preserves_conforming_rows() {
        let (_dir, store) = migrated_store().await;
        let id = store
            .resolve_or_create(&envhealth_core::RegionRef::new("Boulder", "CO"))
            .await
            .expect("region");

        store.ensure_schema().await.expect("rerun");
        let regions = store.list_regions().await.expect("regions");
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, id);
    }

    #[tokio::test]
    async fn unversioned_store_is_adopted_and_backfilled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("legacy.db")).await.expect("open");

        // Layout written by builds that predate the migration ledger.
        for sql in [
            "CREATE TABLE regions (id INTEGER PRIMARY KEY, name TEXT NOT NULL, parent_region TEXT NOT NULL, fips TEXT, latitude REAL, longitude REAL, UNIQUE (name, parent_region))",
            "CREATE TABLE air_quality (id INTEGER PRIMARY KEY, aqi INTEGER, pm25 REAL, timestamp INTEGER)",
            "INSERT INTO regions (name, parent_region, fips) VALUES ('Adams', 'Colorado', '08001')",
            "INSERT INTO air_quality (aqi, pm25, timestamp) VALUES (2, 3.5, 1000)",
        ] {
            sqlx::query(sql).execute(store.pool()).await.expect("legacy ddl");
        }

        let report = store.ensure_schema().await.expect("schema");
        assert_eq!(report.adopted, vec![1]);
        assert_eq!(report.recreated_on_adoption, vec!["air_quality"]);
        assert_eq!(report.version, SCHEMA_VERSION);
        assert!(report.applied.iter().any(|m| m.version == 6));

        let code: Option<String> =
            sqlx::query_scalar("SELECT code FROM regions WHERE name = 'Adams'")
                .fetch_one(store.pool())
                .await
                .expect("code");
        assert_eq!(code.as_deref(), Some("08001"));

        let counts = store.table_counts().await.expect("counts");
        assert_eq!(counts.regions, 1);
        assert_eq!(counts.air_quality, 0);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let (_dir, store) = migrated_store().await;
        sqlx::query(
            "INSERT INTO schema_migrations (version, name, destructive, adopted, applied_at)
             VALUES (99, 'from_the_future', 0, 0, '2030-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .expect("insert");

        let err = store.ensure_schema().await.expect_err("should refuse");
        assert!(matches!(err, StoreError::UnsupportedSchema { found: 99, .. }));
    }
}
