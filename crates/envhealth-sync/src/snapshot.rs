//! Parquet snapshots of the store for downstream analysis.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use envhealth_core::Region;
use envhealth_storage::{AirQualityRow, HealthRow, Store, WeatherRow};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Dump every table into `<out_dir>/snapshots/` and return the manifest path.
pub async fn export_parquet_snapshots(store: &Store, out_dir: &Path) -> Result<PathBuf> {
    let snapshot_dir = out_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let regions = store.list_regions().await?;
    let air_quality = store.list_air_quality(None).await?;
    let weather = store.list_weather(None).await?;
    let health = store.list_health(None).await?;

    let regions_path = snapshot_dir.join("regions.parquet");
    let air_path = snapshot_dir.join("air_quality.parquet");
    let weather_path = snapshot_dir.join("weather.parquet");
    let health_path = snapshot_dir.join("health_records.parquet");

    write_parquet(&regions_path, regions_batch(&regions)?)?;
    write_parquet(&air_path, air_quality_batch(&air_quality)?)?;
    write_parquet(&weather_path, weather_batch(&weather)?)?;
    write_parquet(&health_path, health_batch(&health)?)?;

    let manifest = ParquetManifest {
        schema_version: SNAPSHOT_FORMAT_VERSION,
        files: vec![
            manifest_entry("regions", regions.len(), out_dir, &regions_path)?,
            manifest_entry("air_quality", air_quality.len(), out_dir, &air_path)?,
            manifest_entry("weather", weather.len(), out_dir, &weather_path)?,
            manifest_entry("health_records", health.len(), out_dir, &health_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(path = %manifest_path.display(), "parquet snapshots exported");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn floats(values: impl Iterator<Item = Option<f64>>) -> ArrayRef {
    Arc::new(Float64Array::from(values.collect::<Vec<_>>()))
}

fn ints(values: impl Iterator<Item = Option<i64>>) -> ArrayRef {
    Arc::new(Int64Array::from(values.collect::<Vec<_>>()))
}

fn regions_batch(rows: &[Region]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("parent_region", DataType::Utf8, false),
        ArrowField::new("code", DataType::Utf8, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            ints(rows.iter().map(|r| Some(r.id.0))),
            strings(rows.iter().map(|r| Some(r.name.as_str()))),
            strings(rows.iter().map(|r| Some(r.parent_region.as_str()))),
            strings(rows.iter().map(|r| r.code.as_deref())),
            floats(rows.iter().map(|r| r.latitude)),
            floats(rows.iter().map(|r| r.longitude)),
        ],
    )
    .context("building regions record batch")
}

fn air_quality_batch(rows: &[AirQualityRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("parent_region", DataType::Utf8, false),
        ArrowField::new("observed_at", DataType::Int64, false),
        ArrowField::new("aqi", DataType::Int64, true),
        ArrowField::new("pm25", DataType::Float64, true),
        ArrowField::new("pm10", DataType::Float64, true),
        ArrowField::new("co", DataType::Float64, true),
        ArrowField::new("no2", DataType::Float64, true),
        ArrowField::new("so2", DataType::Float64, true),
        ArrowField::new("o3", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            strings(rows.iter().map(|r| Some(r.region.as_str()))),
            strings(rows.iter().map(|r| Some(r.parent_region.as_str()))),
            ints(rows.iter().map(|r| Some(r.observed_at))),
            ints(rows.iter().map(|r| r.aqi)),
            floats(rows.iter().map(|r| r.pm25)),
            floats(rows.iter().map(|r| r.pm10)),
            floats(rows.iter().map(|r| r.co)),
            floats(rows.iter().map(|r| r.no2)),
            floats(rows.iter().map(|r| r.so2)),
            floats(rows.iter().map(|r| r.o3)),
        ],
    )
    .context("building air quality record batch")
}

fn weather_batch(rows: &[WeatherRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("parent_region", DataType::Utf8, false),
        ArrowField::new("observed_at", DataType::Int64, false),
        ArrowField::new("temperature", DataType::Float64, true),
        ArrowField::new("humidity", DataType::Float64, true),
        ArrowField::new("wind_speed", DataType::Float64, true),
        ArrowField::new("pressure", DataType::Float64, true),
        ArrowField::new("description", DataType::Utf8, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            strings(rows.iter().map(|r| Some(r.region.as_str()))),
            strings(rows.iter().map(|r| Some(r.parent_region.as_str()))),
            ints(rows.iter().map(|r| Some(r.observed_at))),
            floats(rows.iter().map(|r| r.temperature)),
            floats(rows.iter().map(|r| r.humidity)),
            floats(rows.iter().map(|r| r.wind_speed)),
            floats(rows.iter().map(|r| r.pressure)),
            strings(rows.iter().map(|r| r.description.as_deref())),
        ],
    )
    .context("building weather record batch")
}

fn health_batch(rows: &[HealthRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("parent_region", DataType::Utf8, false),
        ArrowField::new("code", DataType::Utf8, true),
        ArrowField::new("gender", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int64, false),
        ArrowField::new("rate", DataType::Float64, false),
        ArrowField::new("lower_ci", DataType::Float64, true),
        ArrowField::new("upper_ci", DataType::Float64, true),
        ArrowField::new("visits", DataType::Int64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            strings(rows.iter().map(|r| Some(r.region.as_str()))),
            strings(rows.iter().map(|r| Some(r.parent_region.as_str()))),
            strings(rows.iter().map(|r| r.code.as_deref())),
            strings(rows.iter().map(|r| Some(r.gender.as_str()))),
            ints(rows.iter().map(|r| Some(r.year))),
            floats(rows.iter().map(|r| Some(r.rate))),
            floats(rows.iter().map(|r| r.lower_ci)),
            floats(rows.iter().map(|r| r.upper_ci)),
            ints(rows.iter().map(|r| Some(r.visits))),
        ],
    )
    .context("building health record batch")
}

fn manifest_entry(name: &str, rows: usize, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use envhealth_core::{Observation, RegionRef, WeatherReading};

    #[tokio::test]
    async fn manifest_hashes_every_snapshot_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("envhealth.db")).await.expect("open");
        store.ensure_schema().await.expect("schema");
        let region = store
            .resolve_or_create(&RegionRef::new("Boulder", "CO"))
            .await
            .expect("region");
        store
            .write_observation(
                region,
                &Observation::weather(
                    1_000,
                    WeatherReading {
                        temperature: Some(281.5),
                        description: Some("light rain".into()),
                        ..Default::default()
                    },
                ),
            )
            .await
            .expect("write");

        let out = dir.path().join("export");
        let manifest_path = export_parquet_snapshots(&store, &out).await.expect("export");
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("json");

        assert_eq!(manifest.files.len(), 4);
        let weather = manifest
            .files
            .iter()
            .find(|f| f.name == "weather")
            .expect("weather entry");
        assert_eq!(weather.rows, 1);
        assert_eq!(weather.path, "snapshots/weather.parquet");
        assert_eq!(weather.sha256.len(), 64);
        assert!(out.join(&weather.path).exists());
    }
}
