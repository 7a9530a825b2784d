//! Region list the polled sources iterate over.

use std::path::Path;

use anyhow::{bail, Context, Result};
use envhealth_core::RegionRef;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CodeValue {
    Text(String),
    Number(i64),
}

#[derive(Debug, Clone, Deserialize)]
struct RegionEntry {
    #[serde(alias = "county", alias = "city")]
    name: String,
    #[serde(alias = "state")]
    parent_region: String,
    #[serde(default, alias = "fips")]
    code: Option<CodeValue>,
    #[serde(default, alias = "lat")]
    latitude: Option<f64>,
    #[serde(default, alias = "lon")]
    longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<RegionEntry>),
    Wrapped { regions: Vec<RegionEntry> },
}

impl From<RegionEntry> for RegionRef {
    fn from(entry: RegionEntry) -> Self {
        let code = entry.code.and_then(|code| match code {
            CodeValue::Text(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            CodeValue::Number(n) => Some(n.to_string()),
        });
        RegionRef {
            name: entry.name.trim().to_string(),
            parent_region: entry.parent_region.trim().to_string(),
            code,
            latitude: entry.latitude,
            longitude: entry.longitude,
        }
    }
}

/// Parse a region list. `.json` files are read as JSON, anything else as YAML.
///
/// Either a bare list or a `regions:` mapping is accepted; every entry needs a name and a
/// parent region.
pub fn load_region_registry(path: impl AsRef<Path>) -> Result<Vec<RegionRef>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let file: RegistryFile = if is_json {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    };

    let entries = match file {
        RegistryFile::Wrapped { regions } => regions,
        RegistryFile::List(regions) => regions,
    };
    let regions: Vec<RegionRef> = entries.into_iter().map(RegionRef::from).collect();
    if let Some(bad) = regions
        .iter()
        .position(|r| r.name.is_empty() || r.parent_region.is_empty())
    {
        bail!(
            "{}: entry {} needs a non-empty name and parent region",
            path.display(),
            bad
        );
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_list_with_legacy_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counties.json");
        std::fs::write(
            &path,
            r#"[{"county": "Adams", "state": "Colorado", "fips": "08001", "lat": 39.87, "lon": -104.33},
                {"county": "Alamosa", "state": "Colorado", "fips": 8003}]"#,
        )
        .expect("write");

        let regions = load_region_registry(&path).expect("load");
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].code.as_deref(), Some("08001"));
        assert_eq!(regions[0].latitude, Some(39.87));
        assert_eq!(regions[1].code.as_deref(), Some("8003"));
        assert_eq!(regions[1].longitude, None);
    }

    #[test]
    fn yaml_mapping_form() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("regions.yaml");
        std::fs::write(
            &path,
            "regions:\n  - name: Boulder\n    parent_region: CO\n    latitude: 40.01\n    longitude: -105.27\n",
        )
        .expect("write");

        let regions = load_region_registry(&path).expect("load");
        assert_eq!(regions, vec![RegionRef::new("Boulder", "CO").with_coordinates(40.01, -105.27)]);
    }

    #[test]
    fn blank_parent_region_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("regions.yaml");
        std::fs::write(&path, "- name: Boulder\n  parent_region: ' '\n").expect("write");
        assert!(load_region_registry(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error_for_the_caller_to_downgrade() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_region_registry(dir.path().join("absent.yaml")).is_err());
    }
}
