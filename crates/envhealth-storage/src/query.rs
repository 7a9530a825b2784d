use chrono::{DateTime, Utc};
use envhealth_core::{Region, RegionId};
use serde::Serialize;

use crate::{Store, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub regions: i64,
    pub air_quality: i64,
    pub weather: i64,
    pub health_records: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AirQualityRow {
    pub id: i64,
    pub region: String,
    pub parent_region: String,
    pub aqi: Option<i64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub so2: Option<f64>,
    pub o3: Option<f64>,
    pub observed_at: i64,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct WeatherRow {
    pub id: i64,
    pub region: String,
    pub parent_region: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub pressure: Option<f64>,
    pub description: Option<String>,
    pub observed_at: i64,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct HealthRow {
    pub id: i64,
    pub region: String,
    pub parent_region: String,
    pub code: Option<String>,
    pub gender: String,
    pub year: i64,
    pub rate: f64,
    pub lower_ci: Option<f64>,
    pub upper_ci: Option<f64>,
    pub visits: i64,
}

#[derive(sqlx::FromRow)]
struct RegionRecord {
    id: i64,
    name: String,
    parent_region: String,
    code: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

// SQLite treats a negative LIMIT as "no limit".
fn limit_value(limit: Option<u32>) -> i64 {
    limit.map(i64::from).unwrap_or(-1)
}

impl Store {
    pub async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let (regions, air_quality, weather, health_records): (i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                    (SELECT COUNT(*) FROM regions),
                    (SELECT COUNT(*) FROM air_quality),
                    (SELECT COUNT(*) FROM weather),
                    (SELECT COUNT(*) FROM health_records)",
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(TableCounts {
            regions,
            air_quality,
            weather,
            health_records,
        })
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>, StoreError> {
        let rows: Vec<RegionRecord> = sqlx::query_as(
            "SELECT id, name, parent_region, code, latitude, longitude FROM regions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Region {
                id: RegionId(r.id),
                name: r.name,
                parent_region: r.parent_region,
                code: r.code,
                latitude: r.latitude,
                longitude: r.longitude,
            })
            .collect())
    }

    pub async fn list_air_quality(&self, limit: Option<u32>) -> Result<Vec<AirQualityRow>, StoreError> {
        let rows = sqlx::query_as(
            "SELECT aq.id, r.name AS region, r.parent_region, aq.aqi, aq.pm25, aq.pm10, aq.co,
                    aq.no2, aq.so2, aq.o3, aq.observed_at, aq.ingested_at
             FROM air_quality aq
             JOIN regions r ON r.id = aq.region_id
             ORDER BY aq.id
             LIMIT ?1",
        )
        .bind(limit_value(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_weather(&self, limit: Option<u32>) -> Result<Vec<WeatherRow>, StoreError> {
        let rows = sqlx::query_as(
            "SELECT w.id, r.name AS region, r.parent_region, w.temperature, w.humidity,
                    w.wind_speed, w.pressure, c.description, w.observed_at, w.ingested_at
             FROM weather w
             JOIN regions r ON r.id = w.region_id
             LEFT JOIN weather_conditions c ON c.id = w.condition_id
             ORDER BY w.id
             LIMIT ?1",
        )
        .bind(limit_value(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_health(&self, limit: Option<u32>) -> Result<Vec<HealthRow>, StoreError> {
        let rows = sqlx::query_as(
            "SELECT h.id, r.name AS region, r.parent_region, r.code, h.gender, h.year, h.rate,
                    h.lower_ci, h.upper_ci, h.visits
             FROM health_records h
             JOIN regions r ON r.id = h.region_id
             ORDER BY h.id
             LIMIT ?1",
        )
        .bind(limit_value(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
