//! Sync pipeline orchestration: polled sources walk the region registry under a persisted
//! cursor, snapshot health sources are swept in a stable order, and every write goes
//! through the store's idempotent writer.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use envhealth_adapters::{
    AsthmaDatasetSource, CsvFileHealthSource, HealthSource, HttpClientConfig, HttpFetcher,
    ObservationSource, OpenWeatherSource,
};
use envhealth_core::{HealthEntry, Observation, RegionRef, WriteOutcome};
use envhealth_storage::{SchemaReport, Store, StoreError, TableCounts};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod registry;
pub mod report;
pub mod snapshot;

pub use registry::load_region_registry;
pub use report::write_reports;
pub use snapshot::{export_parquet_snapshots, ParquetManifest, ParquetManifestFile};

pub const CRATE_NAME: &str = "envhealth-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub regions_file: PathBuf,
    pub reports_dir: PathBuf,
    pub openweather_api_key: Option<String>,
    pub health_csv: Option<PathBuf>,
    pub health_landing_url: String,
    /// Regions visited per polled source per run.
    pub batch_size: usize,
    /// New health rows accepted per run.
    pub max_health_rows: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub export_snapshots: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./envhealth.db"),
            regions_file: PathBuf::from("./config/regions.yaml"),
            reports_dir: PathBuf::from("./reports"),
            openweather_api_key: None,
            health_csv: None,
            health_landing_url: envhealth_adapters::asthma::DEFAULT_LANDING_URL.to_string(),
            batch_size: 25,
            max_health_rows: 25,
            user_agent: "envhealth-bot/0.1".to_string(),
            http_timeout_secs: 30,
            export_snapshots: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("ENVHEALTH_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            regions_file: std::env::var("ENVHEALTH_REGIONS")
                .map(PathBuf::from)
                .unwrap_or(defaults.regions_file),
            reports_dir: std::env::var("ENVHEALTH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            openweather_api_key: std::env::var("OPENWEATHER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            health_csv: std::env::var("ENVHEALTH_HEALTH_CSV").ok().map(PathBuf::from),
            health_landing_url: std::env::var("ENVHEALTH_HEALTH_URL")
                .unwrap_or(defaults.health_landing_url),
            batch_size: std::env::var("ENVHEALTH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_health_rows: std::env::var("ENVHEALTH_MAX_HEALTH_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_health_rows),
            user_agent: std::env::var("ENVHEALTH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("ENVHEALTH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            export_snapshots: std::env::var("ENVHEALTH_EXPORT_SNAPSHOTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.export_snapshots),
        }
    }
}

/// Per-source tallies for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub visited: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Cursor position committed at the end of the run, for cursor-driven sources.
    pub cursor: Option<usize>,
}

impl SourceSummary {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub schema_version: i64,
    pub migrations_applied: usize,
    pub destructive_migrations: usize,
    pub regions: usize,
    pub sources: Vec<SourceSummary>,
    pub totals: TableCounts,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

impl SyncRunSummary {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources.iter().map(|s| s.failed).sum()
    }

    /// Operator-facing summary printed by the CLI.
    pub fn render_text(&self) -> String {
        let mut lines = vec![format!(
            "sync run {} finished: schema v{}, {} regions, {} new rows, {} failures",
            self.run_id,
            self.schema_version,
            self.regions,
            self.inserted(),
            self.failed()
        )];
        for source in &self.sources {
            let cursor = source
                .cursor
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  {:<12} visited={} inserted={} duplicate={} failed={} cursor={}",
                source.source, source.visited, source.inserted, source.duplicates, source.failed, cursor
            ));
        }
        lines.push(format!(
            "  totals: regions={} air_quality={} weather={} health_records={}",
            self.totals.regions, self.totals.air_quality, self.totals.weather, self.totals.health_records
        ));
        if let Some(dir) = &self.reports_dir {
            lines.push(format!("  reports: {dir}"));
        }
        lines.join("\n")
    }
}

/// Why a single item was skipped. Never aborts the run.
#[derive(Debug)]
enum ItemFailure {
    Fetch(envhealth_adapters::AdapterError),
    Decode(envhealth_core::DecodeError),
    Store(StoreError),
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(err) => write!(f, "fetch failed: {err}"),
            Self::Decode(err) => write!(f, "decode failed: {err}"),
            Self::Store(err) => write!(f, "write rejected: {err}"),
        }
    }
}

/// Split store errors into ones that only skip the current item and ones that end the run.
fn item_store_error(err: StoreError) -> Result<ItemFailure, StoreError> {
    if err.is_record_level() {
        Ok(ItemFailure::Store(err))
    } else {
        Err(err)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Store,
    observation_sources: Vec<Box<dyn ObservationSource>>,
    health_sources: Vec<Box<dyn HealthSource>>,
}

impl SyncPipeline {
    /// Open the configured store and wire up the network sources the config enables.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = Store::open(&config.database_path)
            .await
            .with_context(|| format!("opening store {}", config.database_path.display()))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let mut observation_sources: Vec<Box<dyn ObservationSource>> = Vec::new();
        match &config.openweather_api_key {
            Some(key) => {
                observation_sources.push(Box::new(OpenWeatherSource::air_pollution(http.clone(), key.clone())));
                observation_sources.push(Box::new(OpenWeatherSource::current_weather(http.clone(), key.clone())));
            }
            None => warn!("OPENWEATHER_API_KEY not set; air quality and weather sources disabled"),
        }

        let health: Box<dyn HealthSource> = match &config.health_csv {
            Some(path) => Box::new(CsvFileHealthSource::new(path.clone())),
            None => Box::new(AsthmaDatasetSource::new(http).with_landing_url(config.health_landing_url.clone())),
        };

        Ok(Self {
            config,
            store,
            observation_sources,
            health_sources: vec![health],
        })
    }

    /// Assemble a pipeline from an already-open store and explicit sources.
    pub fn with_sources(
        config: SyncConfig,
        store: Store,
        observation_sources: Vec<Box<dyn ObservationSource>>,
        health_sources: Vec<Box<dyn HealthSource>>,
    ) -> Self {
        Self {
            config,
            store,
            observation_sources,
            health_sources,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id).instrument(info_span!("sync_run", %run_id)).await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let schema = self.store.ensure_schema().await.context("bringing store schema up to date")?;
        log_schema_report(&schema);

        let regions = match load_region_registry(&self.config.regions_file) {
            Ok(regions) => regions,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "region registry unavailable; polled sources skipped");
                Vec::new()
            }
        };

        let mut sources = Vec::new();
        for source in &self.observation_sources {
            let span = info_span!("source", source = source.source_name());
            sources.push(self.ingest_observations(source.as_ref(), &regions).instrument(span).await?);
        }
        for source in &self.health_sources {
            let span = info_span!("source", source = source.source_name());
            sources.push(self.ingest_health(source.as_ref()).instrument(span).await?);
        }

        let totals = self.store.table_counts().await?;
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            schema_version: schema.version,
            migrations_applied: schema.applied.len(),
            destructive_migrations: schema.destructive_changes(),
            regions: regions.len(),
            sources,
            totals,
            reports_dir: Some(reports_dir.display().to_string()),
            parquet_manifest: None,
        };

        if self.config.export_snapshots {
            let manifest = export_parquet_snapshots(&self.store, &reports_dir).await?;
            summary.parquet_manifest = Some(manifest.display().to_string());
        }
        write_reports(&reports_dir, &summary).await?;

        info!(
            inserted = summary.inserted(),
            failed = summary.failed(),
            "sync run complete"
        );
        Ok(summary)
    }

    async fn ingest_observations(
        &self,
        source: &dyn ObservationSource,
        regions: &[RegionRef],
    ) -> Result<SourceSummary> {
        let name = source.source_name();
        let mut summary = SourceSummary::new(name);
        let Some(mut walk) = self.store.open_walk(name, regions.len()).await? else {
            info!(source = name, "no regions to poll");
            return Ok(summary);
        };

        // Failed regions are stepped over without using up a batch slot.
        let mut processed = 0;
        while processed < self.config.batch_size {
            let Some(index) = walk.next_index() else {
                break;
            };
            let region = &regions[index];
            summary.visited += 1;
            match self.ingest_observation(source, region).await? {
                Ok(outcome) => {
                    summary.record(outcome);
                    processed += 1;
                }
                Err(failure) => {
                    warn!(source = name, region = %region.label(), "{failure}");
                    summary.failed += 1;
                }
            }
        }

        if let Some(index) = walk.last_visited() {
            self.store.commit_cursor(name, index).await?;
            summary.cursor = Some(index);
        }
        info!(
            source = name,
            visited = summary.visited,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "polled source done"
        );
        Ok(summary)
    }

    async fn ingest_observation(
        &self,
        source: &dyn ObservationSource,
        region: &RegionRef,
    ) -> Result<Result<WriteOutcome, ItemFailure>, StoreError> {
        let raw = match source.fetch(region).await {
            Ok(raw) => raw,
            Err(err) => return Ok(Err(ItemFailure::Fetch(err))),
        };
        let observation = match Observation::decode(source.kind(), &raw) {
            Ok(observation) => observation,
            Err(err) => return Ok(Err(ItemFailure::Decode(err))),
        };
        let region_id = match self.store.resolve_or_create(region).await {
            Ok(id) => id,
            Err(err) => return item_store_error(err).map(Err),
        };
        match self.store.write_observation(region_id, &observation).await {
            Ok(outcome) => {
                debug!(
                    region = %region.label(),
                    observed_at = observation.observed_at,
                    ?outcome,
                    "observation written"
                );
                Ok(Ok(outcome))
            }
            Err(err) => item_store_error(err).map(Err),
        }
    }

    async fn ingest_health(&self, source: &dyn HealthSource) -> Result<SourceSummary> {
        let name = source.source_name();
        let mut summary = SourceSummary::new(name);
        let entries = match source.fetch_all().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(source = name, error = %err, "health source unavailable");
                summary.failed += 1;
                return Ok(summary);
            }
        };

        for entry in stable_order(entries) {
            if summary.inserted >= self.config.max_health_rows {
                info!(source = name, cap = self.config.max_health_rows, "new-row cap reached");
                break;
            }
            summary.visited += 1;
            match self.ingest_health_entry(&entry).await? {
                Ok(outcome) => summary.record(outcome),
                Err(failure) => {
                    warn!(source = name, key = %entry.natural_key(), "{failure}");
                    summary.failed += 1;
                }
            }
        }

        if summary.inserted == 0 && summary.failed == 0 {
            info!(source = name, "all available health records already ingested");
        }
        Ok(summary)
    }

    async fn ingest_health_entry(
        &self,
        entry: &HealthEntry,
    ) -> Result<Result<WriteOutcome, ItemFailure>, StoreError> {
        let region_id = match self.store.resolve_or_create(&entry.region).await {
            Ok(id) => id,
            Err(err) => return item_store_error(err).map(Err),
        };
        match self.store.write_health_record(region_id, &entry.record).await {
            Ok(outcome) => Ok(Ok(outcome)),
            Err(err) => item_store_error(err).map(Err),
        }
    }
}

fn log_schema_report(report: &SchemaReport) {
    if !report.adopted.is_empty() {
        warn!(adopted = ?report.adopted, recreated = ?report.recreated_on_adoption, "adopted unversioned store");
    }
    if report.applied.is_empty() {
        debug!(version = report.version, "schema up to date");
    } else {
        info!(
            version = report.version,
            applied = report.applied.len(),
            destructive = report.destructive_changes(),
            "schema migrated"
        );
    }
}

fn row_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Order entries by the digest of their natural key: scattered across regions and years,
/// yet identical for every run over the same snapshot.
pub fn stable_order(mut entries: Vec<HealthEntry>) -> Vec<HealthEntry> {
    entries.sort_by_cached_key(|entry| row_digest(&entry.natural_key()));
    entries
}

/// Open the configured store, run one pass and close the store again.
pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(config).await?;
    let summary = pipeline.run_once().await;
    pipeline.store().close().await;
    summary
}
