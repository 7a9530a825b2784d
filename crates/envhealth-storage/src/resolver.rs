use envhealth_core::{RegionId, RegionRef};
use sqlx::error::ErrorKind;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::{constraint_kind, Store, StoreError};

impl Store {
    /// Map a region's natural key `(name, parent_region)` to its surrogate id, creating the
    /// region on first sight.
    ///
    /// Optional attributes only ever fill columns that are still NULL; a value already on
    /// file is never overwritten. A code that already belongs to a different region is
    /// reported as [`StoreError::CodeConflict`].
    pub async fn resolve_or_create(&self, region: &RegionRef) -> Result<RegionId, StoreError> {
        let name = region.name.trim();
        let parent_region = region.parent_region.trim();
        if name.is_empty() || parent_region.is_empty() {
            return Err(StoreError::InvalidRegion {
                name: region.name.clone(),
                parent_region: region.parent_region.clone(),
            });
        }
        let code = region
            .code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty());

        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM regions WHERE name = ?1 AND parent_region = ?2")
                .bind(name)
                .bind(parent_region)
                .fetch_optional(&mut *tx)
                .await?;

        let id = match existing {
            Some(id) => {
                if code.is_some() || region.latitude.is_some() || region.longitude.is_some() {
                    let result = sqlx::query(
                        "UPDATE regions
                         SET code = COALESCE(code, ?1),
                             latitude = COALESCE(latitude, ?2),
                             longitude = COALESCE(longitude, ?3)
                         WHERE id = ?4",
                    )
                    .bind(code)
                    .bind(region.latitude)
                    .bind(region.longitude)
                    .bind(id)
                    .execute(&mut *tx)
                    .await;
                    if let Err(err) = result {
                        return Err(code_conflict_or(&mut tx, code, err).await);
                    }
                }
                id
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO regions (name, parent_region, code, latitude, longitude)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(name)
                .bind(parent_region)
                .bind(code)
                .bind(region.latitude)
                .bind(region.longitude)
                .execute(&mut *tx)
                .await;
                match result {
                    Ok(done) => {
                        debug!(region = %region.label(), "created region");
                        done.last_insert_rowid()
                    }
                    Err(err) => return Err(code_conflict_or(&mut tx, code, err).await),
                }
            }
        };

        tx.commit().await?;
        Ok(RegionId(id))
    }

    pub async fn find_region(&self, name: &str, parent_region: &str) -> Result<Option<RegionId>, StoreError> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM regions WHERE name = ?1 AND parent_region = ?2")
                .bind(name.trim())
                .bind(parent_region.trim())
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(RegionId))
    }
}

/// Turn a unique violation on `regions.code` into a typed conflict naming the owner.
async fn code_conflict_or(
    conn: &mut SqliteConnection,
    code: Option<&str>,
    err: sqlx::Error,
) -> StoreError {
    let (Some(code), Some(ErrorKind::UniqueViolation)) = (code, constraint_kind(&err)) else {
        return err.into();
    };
    let owner: Result<Option<i64>, sqlx::Error> =
        sqlx::query_scalar("SELECT id FROM regions WHERE code = ?1")
            .bind(code)
            .fetch_optional(conn)
            .await;
    match owner {
        Ok(Some(owner)) => StoreError::CodeConflict {
            code: code.to_string(),
            owner: RegionId(owner),
        },
        _ => err.into(),
    }
}

/// Get-or-create the id of a normalized weather description.
pub(crate) async fn weather_condition_id(
    conn: &mut SqliteConnection,
    description: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query("INSERT INTO weather_conditions (description) VALUES (?1) ON CONFLICT (description) DO NOTHING")
        .bind(description)
        .execute(&mut *conn)
        .await?;
    sqlx::query_scalar("SELECT id FROM weather_conditions WHERE description = ?1")
        .bind(description)
        .fetch_one(conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_store;

    #[tokio::test]
    async fn resolving_twice_returns_the_same_id() {
        let (_dir, store) = migrated_store().await;
        let boulder = RegionRef::new("Boulder", "CO");

        let first = store.resolve_or_create(&boulder).await.expect("first");
        let second = store.resolve_or_create(&boulder).await.expect("second");
        let denver = store
            .resolve_or_create(&RegionRef::new("Denver", "CO"))
            .await
            .expect("denver");

        assert_eq!(first, second);
        assert_ne!(first, denver);
        assert_eq!(store.table_counts().await.expect("counts").regions, 2);
    }

    #[tokio::test]
    async fn missing_attributes_never_erase_known_values() {
        let (_dir, store) = migrated_store().await;
        let full = RegionRef::new("Adams", "Colorado")
            .with_code("08001")
            .with_coordinates(39.87, -104.33);

        let id = store.resolve_or_create(&full).await.expect("create");
        let again = store
            .resolve_or_create(&RegionRef::new("Adams", "Colorado"))
            .await
            .expect("bare");
        assert_eq!(id, again);

        let regions = store.list_regions().await.expect("list");
        assert_eq!(regions[0].code.as_deref(), Some("08001"));
        assert_eq!(regions[0].latitude, Some(39.87));
        assert_eq!(regions[0].longitude, Some(-104.33));
    }

    #[tokio::test]
    async fn null_attributes_are_filled_but_known_ones_kept() {
        let (_dir, store) = migrated_store().await;
        let mut partial = RegionRef::new("Alamosa", "Colorado");
        partial.latitude = Some(37.57);
        store.resolve_or_create(&partial).await.expect("create");

        let later = RegionRef::new("Alamosa", "Colorado")
            .with_code("08003")
            .with_coordinates(0.0, -105.79);
        store.resolve_or_create(&later).await.expect("update");

        let regions = store.list_regions().await.expect("list");
        assert_eq!(regions[0].code.as_deref(), Some("08003"));
        assert_eq!(regions[0].latitude, Some(37.57));
        assert_eq!(regions[0].longitude, Some(-105.79));
    }

    #[tokio::test]
    async fn code_collision_is_surfaced() {
        let (_dir, store) = migrated_store().await;
        let adams = store
            .resolve_or_create(&RegionRef::new("Adams", "Colorado").with_code("08001"))
            .await
            .expect("adams");

        let err = store
            .resolve_or_create(&RegionRef::new("Arapahoe", "Colorado").with_code("08001"))
            .await
            .expect_err("duplicate code");
        match err {
            StoreError::CodeConflict { code, owner } => {
                assert_eq!(code, "08001");
                assert_eq!(owner, adams);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.table_counts().await.expect("counts").regions, 1);
    }

    #[tokio::test]
    async fn blank_natural_key_is_rejected() {
        let (_dir, store) = migrated_store().await;
        let err = store
            .resolve_or_create(&RegionRef::new("  ", "CO"))
            .await
            .expect_err("blank name");
        assert!(matches!(err, StoreError::InvalidRegion { .. }));
        assert!(store.find_region("", "CO").await.expect("find").is_none());
    }
}
