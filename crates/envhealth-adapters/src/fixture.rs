//! File-backed sources for offline runs and tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use envhealth_core::{HealthEntry, ObservationKind, RawRecord, RegionRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{AdapterError, HealthSource, ObservationSource};

/// Canned responses for a polled source, keyed by `"<name>, <parent_region>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationFixture {
    pub source: String,
    pub kind: ObservationKind,
    #[serde(default)]
    pub records: BTreeMap<String, RawRecord>,
}

#[derive(Debug, Clone)]
pub struct FixtureObservationSource {
    fixture: ObservationFixture,
}

impl FixtureObservationSource {
    pub fn new(fixture: ObservationFixture) -> Self {
        Self { fixture }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }
}

#[async_trait]
impl ObservationSource for FixtureObservationSource {
    fn source_name(&self) -> &str {
        &self.fixture.source
    }

    fn kind(&self) -> ObservationKind {
        self.fixture.kind
    }

    async fn fetch(&self, region: &RegionRef) -> Result<RawRecord, AdapterError> {
        self.fixture
            .records
            .get(&region.label())
            .cloned()
            .ok_or_else(|| AdapterError::Message(format!("no fixture record for {}", region.label())))
    }
}

#[derive(Debug, Clone)]
pub struct FixtureHealthSource {
    entries: Vec<HealthEntry>,
}

impl FixtureHealthSource {
    pub fn new(entries: Vec<HealthEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }
}

#[async_trait]
impl HealthSource for FixtureHealthSource {
    fn source_name(&self) -> &str {
        "health"
    }

    async fn fetch_all(&self) -> Result<Vec<HealthEntry>, AdapterError> {
        Ok(self.entries.clone())
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
