//! OpenWeather air pollution + current weather endpoints, polled per region.

use async_trait::async_trait;
use envhealth_core::{ObservationKind, RawRecord, RegionRef};
use serde_json::Value as JsonValue;

use crate::http::HttpFetcher;
use crate::{AdapterError, ObservationSource};

pub const AIR_POLLUTION_URL: &str = "https://api.openweathermap.org/data/2.5/air_pollution";
pub const CURRENT_WEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Clone)]
pub struct OpenWeatherSource {
    kind: ObservationKind,
    base_url: String,
    api_key: String,
    http: HttpFetcher,
}

impl OpenWeatherSource {
    pub fn air_pollution(http: HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            kind: ObservationKind::AirQuality,
            base_url: AIR_POLLUTION_URL.to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    pub fn current_weather(http: HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            kind: ObservationKind::Weather,
            base_url: CURRENT_WEATHER_URL.to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ObservationSource for OpenWeatherSource {
    fn source_name(&self) -> &str {
        self.kind.as_str()
    }

    fn kind(&self) -> ObservationKind {
        self.kind
    }

    async fn fetch(&self, region: &RegionRef) -> Result<RawRecord, AdapterError> {
        let (Some(lat), Some(lon)) = (region.latitude, region.longitude) else {
            return Err(AdapterError::MissingCoordinates(region.label()));
        };
        let query = [
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("appid", self.api_key.clone()),
        ];
        let payload = self
            .http
            .fetch_json(self.source_name(), &self.base_url, &query)
            .await?;
        match self.kind {
            ObservationKind::AirQuality => air_pollution_record(&payload),
            ObservationKind::Weather => current_weather_record(&payload),
        }
    }
}

fn pointer_f64(payload: &JsonValue, pointer: &str) -> Option<f64> {
    payload.pointer(pointer).and_then(JsonValue::as_f64)
}

/// Flatten the first entry of an air pollution response into a raw record.
pub fn air_pollution_record(payload: &JsonValue) -> Result<RawRecord, AdapterError> {
    let entry = payload
        .pointer("/list/0")
        .ok_or_else(|| AdapterError::Parse("air pollution response has no entries".into()))?;
    let observed_at = entry.get("dt").and_then(JsonValue::as_i64);

    Ok(RawRecord::new(observed_at)
        .with_number("aqi", pointer_f64(entry, "/main/aqi"))
        .with_number("pm2_5", pointer_f64(entry, "/components/pm2_5"))
        .with_number("pm10", pointer_f64(entry, "/components/pm10"))
        .with_number("co", pointer_f64(entry, "/components/co"))
        .with_number("no2", pointer_f64(entry, "/components/no2"))
        .with_number("so2", pointer_f64(entry, "/components/so2"))
        .with_number("o3", pointer_f64(entry, "/components/o3")))
}

pub fn current_weather_record(payload: &JsonValue) -> Result<RawRecord, AdapterError> {
    if !payload.is_object() {
        return Err(AdapterError::Parse("weather response is not an object".into()));
    }
    let observed_at = payload.get("dt").and_then(JsonValue::as_i64);
    let description = payload
        .pointer("/weather/0/description")
        .and_then(JsonValue::as_str)
        .map(str::to_string);

    Ok(RawRecord::new(observed_at)
        .with_number("temperature", pointer_f64(payload, "/main/temp"))
        .with_number("humidity", pointer_f64(payload, "/main/humidity"))
        .with_number("pressure", pointer_f64(payload, "/main/pressure"))
        .with_number("wind_speed", pointer_f64(payload, "/wind/speed"))
        .with_text("description", description))
}
