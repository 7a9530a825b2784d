//! Core domain model for environmental + public-health ingestion.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "envhealth-core";

/// Surrogate identifier minted by the store for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub i64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural key plus optional attributes of a region, as supplied by a source or the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRef {
    pub name: String,
    pub parent_region: String,
    pub code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl RegionRef {
    pub fn new(name: impl Into<String>, parent_region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_region: parent_region.into(),
            code: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn label(&self) -> String {
        format!("{}, {}", self.name, self.parent_region)
    }
}

/// Persisted region row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub parent_region: String,
    pub code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    AirQuality,
    Weather,
}

impl ObservationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AirQuality => "air_quality",
            Self::Weather => "weather",
        }
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pollutant concentrations as reported by the air pollution source. Units are µg/m³.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AirQualityReading {
    pub aqi: Option<i64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub so2: Option<f64>,
    pub o3: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub pressure: Option<f64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurements {
    AirQuality(AirQualityReading),
    Weather(WeatherReading),
}

impl Measurements {
    pub fn kind(&self) -> ObservationKind {
        match self {
            Self::AirQuality(_) => ObservationKind::AirQuality,
            Self::Weather(_) => ObservationKind::Weather,
        }
    }
}

/// One timestamped environmental reading. `observed_at` is the source's event time in unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub observed_at: i64,
    pub measurements: Measurements,
}

impl Observation {
    pub fn air_quality(observed_at: i64, reading: AirQualityReading) -> Self {
        Self {
            observed_at,
            measurements: Measurements::AirQuality(reading),
        }
    }

    pub fn weather(observed_at: i64, reading: WeatherReading) -> Self {
        Self {
            observed_at,
            measurements: Measurements::Weather(reading),
        }
    }

    pub fn kind(&self) -> ObservationKind {
        self.measurements.kind()
    }

    /// Decode a raw source record into a typed observation of `kind`.
    ///
    /// Absent or null measurement fields become `None`; a missing event time is an error
    /// because it is part of the dedup key.
    pub fn decode(kind: ObservationKind, raw: &RawRecord) -> Result<Self, DecodeError> {
        let observed_at = raw.observed_at.ok_or(DecodeError::MissingTimestamp)?;
        let measurements = match kind {
            ObservationKind::AirQuality => Measurements::AirQuality(AirQualityReading {
                aqi: raw.integer("aqi")?,
                pm25: raw.number("pm2_5")?,
                pm10: raw.number("pm10")?,
                co: raw.number("co")?,
                no2: raw.number("no2")?,
                so2: raw.number("so2")?,
                o3: raw.number("o3")?,
            }),
            ObservationKind::Weather => Measurements::Weather(WeatherReading {
                temperature: raw.number("temperature")?,
                humidity: raw.number("humidity")?,
                wind_speed: raw.number("wind_speed")?,
                pressure: raw.number("pressure")?,
                description: raw.text("description"),
            }),
        };
        Ok(Self {
            observed_at,
            measurements,
        })
    }
}

/// One (region, gender, year) asthma statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub gender: String,
    pub year: i32,
    pub rate: f64,
    pub lower_ci: Option<f64>,
    pub upper_ci: Option<f64>,
    pub visits: i64,
}

/// Health record paired with the region it describes, as produced by a snapshot source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEntry {
    pub region: RegionRef,
    pub record: HealthRecord,
}

impl HealthEntry {
    /// Stable identity of the row, independent of the order the source lists it in.
    pub fn natural_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.region.parent_region, self.region.name, self.record.gender, self.record.year
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Number(f64),
    Text(String),
}

/// Source-specific record handed over by an adapter before decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub observed_at: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    pub fn new(observed_at: Option<i64>) -> Self {
        Self {
            observed_at,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_number(mut self, name: &str, value: Option<f64>) -> Self {
        let value = value.map(RawValue::Number).unwrap_or(RawValue::Null);
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_text(mut self, name: &str, value: Option<String>) -> Self {
        let value = value.map(RawValue::Text).unwrap_or(RawValue::Null);
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Numeric field lookup. Blank text and NaN read as missing; other non-numeric text is an error.
    pub fn number(&self, name: &str) -> Result<Option<f64>, DecodeError> {
        match self.fields.get(name) {
            None | Some(RawValue::Null) => Ok(None),
            Some(RawValue::Number(v)) if v.is_nan() => Ok(None),
            Some(RawValue::Number(v)) => Ok(Some(*v)),
            Some(RawValue::Text(text)) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
                    .parse::<f64>()
                    .map(|v| if v.is_nan() { None } else { Some(v) })
                    .map_err(|_| DecodeError::InvalidField {
                        field: name.to_string(),
                        value: text.clone(),
                    })
            }
        }
    }

    pub fn integer(&self, name: &str) -> Result<Option<i64>, DecodeError> {
        match self.number(name)? {
            None => Ok(None),
            Some(v) if v.is_finite() && v.fract() == 0.0 => Ok(Some(v as i64)),
            Some(v) => Err(DecodeError::InvalidField {
                field: name.to_string(),
                value: v.to_string(),
            }),
        }
    }

    pub fn text(&self, name: &str) -> Option<String> {
        match self.fields.get(name) {
            Some(RawValue::Text(text)) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Some(RawValue::Number(v)) => Some(v.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("record has no event timestamp")]
    MissingTimestamp,
    #[error("field {field} has unusable value {value:?}")]
    InvalidField { field: String, value: String },
}

/// Result of an idempotent write. A duplicate is a routine outcome, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Duplicate,
}

impl WriteOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}
