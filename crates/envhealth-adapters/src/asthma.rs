//! County asthma statistics published as a downloadable table behind a landing page.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use envhealth_core::{HealthEntry, HealthRecord, RegionRef};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::http::HttpFetcher;
use crate::{AdapterError, HealthSource};

pub const DEFAULT_LANDING_URL: &str = "https://coepht.colorado.gov/asthma-data";
pub const DEFAULT_STATE: &str = "Colorado";
const DOWNLOAD_LINK_TEXT: &str = "download asthma data";
const DEFAULT_GENDER: &str = "Both genders";
const DEFAULT_COUNTY: &str = "Statewide";

/// Column layout of the published table. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct AsthmaRow {
    #[serde(rename = "COUNTY")]
    county: Option<String>,
    #[serde(rename = "RATE")]
    rate: Option<String>,
    #[serde(rename = "L95CL")]
    lower_ci: Option<String>,
    #[serde(rename = "U95CL")]
    upper_ci: Option<String>,
    #[serde(rename = "VISITS")]
    visits: Option<String>,
    #[serde(rename = "YEAR")]
    year: Option<String>,
    #[serde(rename = "GENDER")]
    gender: Option<String>,
    #[serde(rename = "MEASURE")]
    measure: Option<String>,
    #[serde(rename = "HEALTHOUTCOMEID")]
    outcome: Option<String>,
    #[serde(rename = "cofips")]
    fips: Option<String>,
}

impl AsthmaRow {
    /// Build a row from a lookup of cell text by column name.
    fn from_columns(mut cell: impl FnMut(&str) -> Option<String>) -> Self {
        Self {
            county: cell("COUNTY"),
            rate: cell("RATE"),
            lower_ci: cell("L95CL"),
            upper_ci: cell("U95CL"),
            visits: cell("VISITS"),
            year: cell("YEAR"),
            gender: cell("GENDER"),
            measure: cell("MEASURE"),
            outcome: cell("HEALTHOUTCOMEID"),
            fips: cell("cofips"),
        }
    }
}

const REQUIRED_COLUMNS: &[&str] = &[
    "COUNTY",
    "RATE",
    "L95CL",
    "U95CL",
    "VISITS",
    "YEAR",
    "GENDER",
    "MEASURE",
    "HEALTHOUTCOMEID",
    "cofips",
];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

fn check_columns(headers: &[&str]) -> Result<(), AdapterError> {
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| !headers.contains(column))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(AdapterError::Parse(format!(
        "asthma dataset is missing required columns: {}",
        missing.join(", ")
    )))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_float(value: Option<&str>) -> Result<Option<f64>, AdapterError> {
    let Some(text) = non_blank(value) else {
        return Ok(None);
    };
    let parsed = text
        .parse::<f64>()
        .map_err(|_| AdapterError::Parse(format!("not a number: {text:?}")))?;
    Ok((!parsed.is_nan()).then_some(parsed))
}

fn parse_int(value: Option<&str>) -> Result<Option<i64>, AdapterError> {
    let Some(value) = parse_float(value)? else {
        return Ok(None);
    };
    let whole = value.trunc();
    if whole < i64::MIN as f64 || whole >= i64::MAX as f64 {
        return Err(AdapterError::Parse(format!("integer out of range: {value}")));
    }
    Ok(Some(whole as i64))
}

/// Spreadsheet exports turn `08001` into `8001.0`; strip the float suffix.
pub fn normalize_fips(value: Option<&str>) -> Option<String> {
    let text = non_blank(value)?;
    let text = text.strip_suffix(".0").unwrap_or(text);
    (!text.is_empty()).then(|| text.to_string())
}

enum RowOutcome {
    Kept(HealthEntry),
    /// Another outcome or measure.
    Filtered,
    /// No usable rate or year.
    Incomplete,
}

fn entry_from_row(row: AsthmaRow, state: &str) -> Result<RowOutcome, AdapterError> {
    let outcome = non_blank(row.outcome.as_deref()).unwrap_or_default();
    let measure = non_blank(row.measure.as_deref()).unwrap_or_default();
    if !outcome.eq_ignore_ascii_case("asthma") || !measure.eq_ignore_ascii_case("age adjusted rate") {
        return Ok(RowOutcome::Filtered);
    }
    let (Some(rate), Some(year)) = (parse_float(row.rate.as_deref())?, parse_int(row.year.as_deref())?)
    else {
        return Ok(RowOutcome::Incomplete);
    };
    let year = i32::try_from(year).map_err(|_| AdapterError::Parse(format!("year out of range: {year}")))?;

    let county = non_blank(row.county.as_deref()).unwrap_or(DEFAULT_COUNTY);
    let mut region = RegionRef::new(county, state);
    region.code = normalize_fips(row.fips.as_deref());

    Ok(RowOutcome::Kept(HealthEntry {
        region,
        record: HealthRecord {
            gender: non_blank(row.gender.as_deref())
                .unwrap_or(DEFAULT_GENDER)
                .to_string(),
            year,
            rate,
            lower_ci: parse_float(row.lower_ci.as_deref())?,
            upper_ci: parse_float(row.upper_ci.as_deref())?,
            visits: parse_int(row.visits.as_deref())?.unwrap_or(0),
        },
    }))
}

/// Turn decoded rows into entries. A row that fails to decode or parse is logged and
/// skipped; the rest of the table still comes through.
fn collect_entries(
    rows: impl Iterator<Item = Result<AsthmaRow, AdapterError>>,
    state: &str,
) -> Vec<HealthEntry> {
    let mut entries = Vec::new();
    let (mut incomplete, mut rejected) = (0usize, 0usize);
    // Line 1 is the header.
    for (line, row) in (2usize..).zip(rows) {
        match row.and_then(|row| entry_from_row(row, state)) {
            Ok(RowOutcome::Kept(entry)) => entries.push(entry),
            Ok(RowOutcome::Filtered) => {}
            Ok(RowOutcome::Incomplete) => incomplete += 1,
            Err(err) => {
                warn!(line, error = %err, "skipping malformed asthma row");
                rejected += 1;
            }
        }
    }
    debug!(kept = entries.len(), incomplete, rejected, "parsed asthma dataset");
    entries
}

/// Parse the published CSV, keeping age-adjusted asthma rates with a usable rate and year.
pub fn parse_asthma_csv<R: Read>(reader: R, state: &str) -> Result<Vec<HealthEntry>, AdapterError> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = csv.headers()?.clone();
    check_columns(&headers.iter().collect::<Vec<_>>())?;
    let rows = csv
        .deserialize::<AsthmaRow>()
        .map(|row| row.map_err(AdapterError::from));
    Ok(collect_entries(rows, state))
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(text) => Some(text.clone()),
        Data::Float(value) => Some(value.to_string()),
        Data::Int(value) => Some(value.to_string()),
        other => Some(other.to_string()),
    }
}

/// Parse the first sheet of an `.xlsx`/`.xls` workbook with the same rules as the CSV.
pub fn parse_asthma_workbook(body: &[u8], state: &str) -> Result<Vec<HealthEntry>, AdapterError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(body.to_vec()))
        .map_err(|e| AdapterError::Parse(format!("reading workbook: {e}")))?;
    let sheet = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AdapterError::Parse("workbook has no sheets".into()))?
        .map_err(|e| AdapterError::Parse(format!("reading first sheet: {e}")))?;

    let mut rows = sheet.rows();
    let headers: Vec<String> = rows
        .next()
        .map(|cells| {
            cells
                .iter()
                .map(|cell| cell_text(cell).map(|h| h.trim().to_string()).unwrap_or_default())
                .collect()
        })
        .unwrap_or_default();
    check_columns(&headers.iter().map(String::as_str).collect::<Vec<_>>())?;

    let rows = rows.map(|cells| {
        Ok::<_, AdapterError>(AsthmaRow::from_columns(|name| {
            headers
                .iter()
                .position(|h| h == name)
                .and_then(|index| cells.get(index))
                .and_then(cell_text)
        }))
    });
    Ok(collect_entries(rows, state))
}

/// Workbooks are recognised by their magic bytes or, failing that, the file extension.
pub fn looks_like_workbook(location: &str, body: &[u8]) -> bool {
    if body.starts_with(ZIP_MAGIC) || body.starts_with(OLE_MAGIC) {
        return true;
    }
    let path = location.split(['?', '#']).next().unwrap_or_default();
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "xlsx" | "xlsm" | "xls"))
}

/// Parse a downloaded or saved copy of the dataset in whichever format it arrived.
pub fn parse_asthma_dataset(location: &str, body: &[u8], state: &str) -> Result<Vec<HealthEntry>, AdapterError> {
    if looks_like_workbook(location, body) {
        parse_asthma_workbook(body, state)
    } else {
        parse_asthma_csv(body, state)
    }
}

/// Find the dataset download link on the landing page, resolved against `base_url`.
pub fn find_download_link(html: &str, base_url: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;
    let base = Url::parse(base_url).map_err(|e| AdapterError::Parse(e.to_string()))?;

    for anchor in document.select(&anchors) {
        let text = anchor.text().collect::<String>().to_ascii_lowercase();
        if !text.contains(DOWNLOAD_LINK_TEXT) {
            continue;
        }
        if let Some(href) = anchor.value().attr("href") {
            let resolved = base
                .join(href.trim())
                .map_err(|e| AdapterError::Parse(e.to_string()))?;
            return Ok(Some(resolved.to_string()));
        }
    }
    Ok(None)
}

/// Pull the file id out of a Google Drive share link (`/d/<id>/` or `?id=<id>`).
pub fn extract_drive_file_id(href: &str) -> Option<String> {
    if let Some(rest) = href.split("/d/").nth(1) {
        if let Some((id, _)) = rest.split_once('/') {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    let url = Url::parse(href).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())
}

/// Direct-download form of a share link; other links are returned unchanged.
pub fn direct_download_url(href: &str) -> String {
    match extract_drive_file_id(href) {
        Some(id) => format!("https://drive.google.com/uc?export=download&id={id}"),
        None => href.to_string(),
    }
}

/// Scrapes the landing page for the download link on every run.
#[derive(Debug, Clone)]
pub struct AsthmaDatasetSource {
    landing_url: String,
    state: String,
    http: HttpFetcher,
}

impl AsthmaDatasetSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            landing_url: DEFAULT_LANDING_URL.to_string(),
            state: DEFAULT_STATE.to_string(),
            http,
        }
    }

    pub fn with_landing_url(mut self, landing_url: impl Into<String>) -> Self {
        self.landing_url = landing_url.into();
        self
    }
}

#[async_trait]
impl HealthSource for AsthmaDatasetSource {
    fn source_name(&self) -> &str {
        "health"
    }

    async fn fetch_all(&self) -> Result<Vec<HealthEntry>, AdapterError> {
        let page = self.http.fetch_text(self.source_name(), &self.landing_url).await?;
        let Some(link) = find_download_link(&page, &self.landing_url)? else {
            return Err(AdapterError::Parse(
                "could not find the asthma download link on the landing page".into(),
            ));
        };
        let download_url = direct_download_url(&link);
        info!(url = %crate::http::redact_query(&download_url), "downloading asthma dataset");
        let body = self
            .http
            .fetch_bytes(self.source_name(), &download_url, &[])
            .await?;
        parse_asthma_dataset(&download_url, &body, &self.state)
    }
}

/// Reads a locally saved copy of the dataset, CSV or workbook.
#[derive(Debug, Clone)]
pub struct CsvFileHealthSource {
    path: PathBuf,
    state: String,
}

impl CsvFileHealthSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: DEFAULT_STATE.to_string(),
        }
    }
}

#[async_trait]
impl HealthSource for CsvFileHealthSource {
    fn source_name(&self) -> &str {
        "health"
    }

    async fn fetch_all(&self) -> Result<Vec<HealthEntry>, AdapterError> {
        let body = std::fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_asthma_dataset(&self.path.display().to_string(), &body, &self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
COUNTY,RATE,L95CL,U95CL,VISITS,YEAR,GENDER,MEASURE,HEALTHOUTCOMEID,cofips
Adams,51.2,47.0,55.4,118,2020,Female,Age Adjusted Rate,Asthma,8001.0
Adams,12.0,,,30,2020,Female,Crude Rate,Asthma,8001.0
Adams,40.0,,,10,2020,Male,Age Adjusted Rate,COPD,8001.0
Alamosa,,1.0,2.0,4,2020,Male,Age Adjusted Rate,Asthma,8003
,33.3,30.1,36.5,,2019,,age adjusted rate,asthma,
";

    #[test]
    fn csv_rows_are_filtered_and_defaulted() {
        let entries = parse_asthma_csv(SAMPLE.as_bytes(), "Colorado").expect("parse");
        assert_eq!(entries.len(), 2);

        let adams = &entries[0];
        assert_eq!(adams.region.name, "Adams");
        assert_eq!(adams.region.parent_region, "Colorado");
        assert_eq!(adams.region.code.as_deref(), Some("8001"));
        assert_eq!(adams.record.rate, 51.2);
        assert_eq!(adams.record.visits, 118);

        let statewide = &entries[1];
        assert_eq!(statewide.region.name, "Statewide");
        assert_eq!(statewide.region.code, None);
        assert_eq!(statewide.record.gender, "Both genders");
        assert_eq!(statewide.record.visits, 0);
        assert_eq!(statewide.record.year, 2019);
    }

    #[test]
    fn malformed_rows_are_skipped_without_losing_the_rest() {
        let csv = "\
COUNTY,RATE,L95CL,U95CL,VISITS,YEAR,GENDER,MEASURE,HEALTHOUTCOMEID,cofips
Adams,51.2,47.0,55.4,118,2020,Female,Age Adjusted Rate,Asthma,8001.0
Baca,*,,,3,2020,Female,Age Adjusted Rate,Asthma,8009.0
Crowley,12.5
Otero,20.0,,,4,99999999999,Male,Age Adjusted Rate,Asthma,8089.0
Denver,58.9,55.0,62.8,240,2020,Female,Age Adjusted Rate,Asthma,8031.0
";
        let entries = parse_asthma_csv(csv.as_bytes(), "Colorado").expect("parse");
        let names: Vec<&str> = entries.iter().map(|e| e.region.name.as_str()).collect();
        assert_eq!(names, vec!["Adams", "Denver"]);
    }

    #[test]
    fn first_sheet_of_a_workbook_goes_through_the_same_rules() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, name) in REQUIRED_COLUMNS.iter().enumerate() {
            sheet.write_string(0, col as u16, *name).expect("header");
        }
        let rows: [(&str, &str, &str); 3] = [
            ("Adams", "51.2", "Age Adjusted Rate"),
            ("Adams", "12.0", "Crude Rate"),
            ("Baca", "*", "Age Adjusted Rate"),
        ];
        for (i, (county, rate, measure)) in rows.iter().enumerate() {
            let row = i as u32 + 1;
            sheet.write_string(row, 0, *county).expect("county");
            match rate.parse::<f64>() {
                Ok(value) => sheet.write_number(row, 1, value).expect("rate"),
                Err(_) => sheet.write_string(row, 1, *rate).expect("rate"),
            };
            sheet.write_number(row, 4, 118.0).expect("visits");
            sheet.write_number(row, 5, 2020.0).expect("year");
            sheet.write_string(row, 6, "Female").expect("gender");
            sheet.write_string(row, 7, *measure).expect("measure");
            sheet.write_string(row, 8, "Asthma").expect("outcome");
            sheet.write_number(row, 9, 8001.0).expect("fips");
        }
        let body = workbook.save_to_buffer().expect("xlsx bytes");

        // Drive direct-download links carry no extension.
        assert!(looks_like_workbook("https://drive.google.com/uc?export=download&id=x", &body));
        let entries = parse_asthma_dataset("https://drive.google.com/uc?export=download&id=x", &body, "Colorado")
            .expect("parse workbook");
        assert_eq!(entries.len(), 1);
        let adams = &entries[0];
        assert_eq!(adams.region.name, "Adams");
        assert_eq!(adams.region.code.as_deref(), Some("8001"));
        assert_eq!(adams.record.year, 2020);
        assert_eq!(adams.record.rate, 51.2);
        assert_eq!(adams.record.visits, 118);
        assert_eq!(adams.record.lower_ci, None);
    }

    #[test]
    fn workbook_detection_falls_back_to_the_extension() {
        assert!(looks_like_workbook("/data/asthma.XLSX", b""));
        assert!(looks_like_workbook("https://example.test/asthma.xls?dl=1", b""));
        assert!(!looks_like_workbook("/data/asthma.csv", SAMPLE.as_bytes()));
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = parse_asthma_csv("COUNTY,RATE\nAdams,1.0\n".as_bytes(), "Colorado")
            .expect_err("missing columns");
        match err {
            AdapterError::Parse(message) => {
                assert!(message.contains("YEAR"));
                assert!(message.contains("cofips"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn download_link_is_found_and_resolved() {
        let html = r#"<html><body>
            <a href="/about">About</a>
            <a href="https://drive.google.com/file/d/abc123XYZ/view?usp=sharing"> Download Asthma Data </a>
        </body></html>"#;
        let link = find_download_link(html, DEFAULT_LANDING_URL)
            .expect("parse")
            .expect("link");
        assert_eq!(extract_drive_file_id(&link).as_deref(), Some("abc123XYZ"));
        assert_eq!(
            direct_download_url(&link),
            "https://drive.google.com/uc?export=download&id=abc123XYZ"
        );

        let relative = r#"<a href="files/asthma.csv">download asthma data (csv)</a>"#;
        assert_eq!(
            find_download_link(relative, "https://example.test/health/")
                .expect("parse")
                .as_deref(),
            Some("https://example.test/health/files/asthma.csv")
        );
        assert_eq!(find_download_link("<p>nothing</p>", DEFAULT_LANDING_URL).expect("parse"), None);
    }

    #[test]
    fn drive_ids_from_query_strings() {
        assert_eq!(
            extract_drive_file_id("https://drive.google.com/open?id=q1w2e3").as_deref(),
            Some("q1w2e3")
        );
        assert_eq!(extract_drive_file_id("https://example.test/data.csv"), None);
    }

    #[test]
    fn fips_normalization() {
        assert_eq!(normalize_fips(Some("8001.0")).as_deref(), Some("8001"));
        assert_eq!(normalize_fips(Some(" 08003 ")).as_deref(), Some("08003"));
        assert_eq!(normalize_fips(Some("")), None);
        assert_eq!(normalize_fips(None), None);
    }

    #[tokio::test]
    async fn csv_file_source_reads_local_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("asthma.csv");
        std::fs::write(&path, SAMPLE).expect("write");

        let source = CsvFileHealthSource::new(&path);
        let entries = source.fetch_all().await.expect("entries");
        assert_eq!(entries.len(), 2);
    }
}
