use chrono::Utc;
use envhealth_core::{HealthRecord, Measurements, Observation, RegionId, WriteOutcome};
use sqlx::error::ErrorKind;
use sqlx::sqlite::SqliteQueryResult;

use crate::resolver::weather_condition_id;
use crate::{constraint_kind, Store, StoreError};

impl Store {
    /// Insert an observation unless one of the same kind already exists for
    /// `(region_id, observed_at)`. The duplicate case reports [`WriteOutcome::Duplicate`].
    pub async fn write_observation(
        &self,
        region_id: RegionId,
        observation: &Observation,
    ) -> Result<WriteOutcome, StoreError> {
        let ingested_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let (table, result) = match &observation.measurements {
            Measurements::AirQuality(reading) => {
                let result = sqlx::query(
                    "INSERT INTO air_quality
                        (region_id, aqi, pm25, pm10, co, no2, so2, o3, observed_at, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (region_id, observed_at) DO NOTHING",
                )
                .bind(region_id.0)
                .bind(reading.aqi)
                .bind(reading.pm25)
                .bind(reading.pm10)
                .bind(reading.co)
                .bind(reading.no2)
                .bind(reading.so2)
                .bind(reading.o3)
                .bind(observation.observed_at)
                .bind(ingested_at)
                .execute(&mut *tx)
                .await;
                ("air_quality", result)
            }
            Measurements::Weather(reading) => {
                let condition_id = match reading.description.as_deref() {
                    Some(description) => Some(weather_condition_id(&mut tx, description).await?),
                    None => None,
                };
                let result = sqlx::query(
                    "INSERT INTO weather
                        (region_id, temperature, humidity, wind_speed, pressure, condition_id, observed_at, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT (region_id, observed_at) DO NOTHING",
                )
                .bind(region_id.0)
                .bind(reading.temperature)
                .bind(reading.humidity)
                .bind(reading.wind_speed)
                .bind(reading.pressure)
                .bind(condition_id)
                .bind(observation.observed_at)
                .bind(ingested_at)
                .execute(&mut *tx)
                .await;
                ("weather", result)
            }
        };

        let outcome = outcome_of(table, region_id, result)?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Insert-or-ignore on `(region_id, gender, year)`: the first stored values win.
    pub async fn write_health_record(
        &self,
        region_id: RegionId,
        record: &HealthRecord,
    ) -> Result<WriteOutcome, StoreError> {
        let gender = record.gender.trim();
        if gender.is_empty() {
            return Err(StoreError::Integrity {
                table: "health_records",
                message: "gender is part of the dedup key and must not be empty".to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO health_records
                (region_id, gender, year, rate, lower_ci, upper_ci, visits, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (region_id, gender, year) DO NOTHING",
        )
        .bind(region_id.0)
        .bind(gender)
        .bind(record.year)
        .bind(record.rate)
        .bind(record.lower_ci)
        .bind(record.upper_ci)
        .bind(record.visits)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        let outcome = outcome_of("health_records", region_id, result)?;
        tx.commit().await?;
        Ok(outcome)
    }
}

fn outcome_of(
    table: &'static str,
    region_id: RegionId,
    result: Result<SqliteQueryResult, sqlx::Error>,
) -> Result<WriteOutcome, StoreError> {
    match result {
        Ok(done) if done.rows_affected() == 0 => Ok(WriteOutcome::Duplicate),
        Ok(_) => Ok(WriteOutcome::Inserted),
        Err(err) => Err(match constraint_kind(&err) {
            Some(ErrorKind::ForeignKeyViolation) => StoreError::UnknownRegion(region_id),
            Some(ErrorKind::NotNullViolation | ErrorKind::CheckViolation | ErrorKind::UniqueViolation) => {
                StoreError::Integrity {
                    table,
                    message: err.to_string(),
                }
            }
            _ => StoreError::Database(err),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_store;
    use envhealth_core::{AirQualityReading, RegionRef, WeatherReading};

    fn reading() -> AirQualityReading {
        AirQualityReading {
            aqi: Some(2),
            pm25: Some(5.1),
            pm10: Some(9.8),
            co: None,
            no2: Some(3.2),
            so2: None,
            o3: Some(61.0),
        }
    }

    #[tokio::test]
    async fn duplicate_observation_is_reported_not_raised() {
        let (_dir, store) = migrated_store().await;
        let region = store
            .resolve_or_create(&RegionRef::new("Boulder", "CO"))
            .await
            .expect("region");
        assert_eq!(region, RegionId(1));

        let obs = Observation::air_quality(1000, reading());
        let first = store.write_observation(region, &obs).await.expect("first");
        let second = store.write_observation(region, &obs).await.expect("second");

        assert!(first.is_inserted());
        assert_eq!(second, WriteOutcome::Duplicate);
        let rows = store.list_air_quality(None).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].observed_at, 1000);
        assert_eq!(rows[0].co, None);
    }

    #[tokio::test]
    async fn observation_kinds_dedup_independently() {
        let (_dir, store) = migrated_store().await;
        let region = store
            .resolve_or_create(&RegionRef::new("Denver", "CO"))
            .await
            .expect("region");

        let air = Observation::air_quality(2000, reading());
        let weather = Observation::weather(
            2000,
            WeatherReading {
                temperature: Some(284.1),
                humidity: Some(40.0),
                wind_speed: Some(3.6),
                pressure: Some(1016.0),
                description: Some("scattered clouds".into()),
            },
        );

        assert!(store.write_observation(region, &air).await.expect("air").is_inserted());
        assert!(store
            .write_observation(region, &weather)
            .await
            .expect("weather")
            .is_inserted());
        assert!(!store
            .write_observation(region, &weather)
            .await
            .expect("weather again")
            .is_inserted());

        let rows = store.list_weather(None).await.expect("weather rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description.as_deref(), Some("scattered clouds"));
    }

    #[tokio::test]
    async fn unknown_region_is_an_integrity_failure() {
        let (_dir, store) = migrated_store().await;
        let err = store
            .write_observation(RegionId(42), &Observation::air_quality(1000, reading()))
            .await
            .expect_err("fk violation");
        assert!(matches!(err, StoreError::UnknownRegion(RegionId(42))));
        assert!(err.is_record_level());
        assert_eq!(store.table_counts().await.expect("counts").air_quality, 0);
    }

    #[tokio::test]
    async fn health_record_is_insert_or_ignore() {
        let (_dir, store) = migrated_store().await;
        for name in ["Adams", "Alamosa", "Arapahoe", "Archuleta", "Baca"] {
            store
                .resolve_or_create(&RegionRef::new(name, "Colorado"))
                .await
                .expect("region");
        }
        let region = RegionId(5);

        let first = HealthRecord {
            gender: "Female".into(),
            year: 2020,
            rate: 51.2,
            lower_ci: Some(47.0),
            upper_ci: Some(55.4),
            visits: 118,
        };
        let second = HealthRecord {
            rate: 99.9,
            ..first.clone()
        };

        assert!(store.write_health_record(region, &first).await.expect("first").is_inserted());
        assert_eq!(
            store.write_health_record(region, &second).await.expect("second"),
            WriteOutcome::Duplicate
        );

        let rows = store.list_health(None).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rate, 51.2);
        assert_eq!(rows[0].region, "Baca");
    }

    #[tokio::test]
    async fn blank_gender_is_rejected() {
        let (_dir, store) = migrated_store().await;
        let region = store
            .resolve_or_create(&RegionRef::new("Baca", "Colorado"))
            .await
            .expect("region");
        let record = HealthRecord {
            gender: " ".into(),
            year: 2019,
            rate: 10.0,
            lower_ci: None,
            upper_ci: None,
            visits: 0,
        };
        let err = store
            .write_health_record(region, &record)
            .await
            .expect_err("blank gender");
        assert!(matches!(err, StoreError::Integrity { .. }));
    }
}
