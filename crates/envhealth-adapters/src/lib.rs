//! Source contracts + implementations producing raw records for the ingestion pipeline.

use async_trait::async_trait;
use envhealth_core::{HealthEntry, ObservationKind, RawRecord, RegionRef};
use thiserror::Error;

pub mod asthma;
pub mod fixture;
pub mod http;
pub mod openweather;

pub use asthma::{AsthmaDatasetSource, CsvFileHealthSource};
pub use fixture::{FixtureHealthSource, FixtureObservationSource, ObservationFixture};
pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
pub use openweather::OpenWeatherSource;

pub const CRATE_NAME: &str = "envhealth-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("region {0} has no coordinates to query with")]
    MissingCoordinates(String),
    #[error("unexpected response shape: {0}")]
    Parse(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Source polled once per region, returning that region's current reading.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Name the ingestion cursor for this source is stored under.
    fn source_name(&self) -> &str;
    fn kind(&self) -> ObservationKind;

    async fn fetch(&self, region: &RegionRef) -> Result<RawRecord, AdapterError>;
}

/// Source publishing a complete snapshot of health statistics on each download.
#[async_trait]
pub trait HealthSource: Send + Sync {
    fn source_name(&self) -> &str;

    async fn fetch_all(&self) -> Result<Vec<HealthEntry>, AdapterError>;
}
