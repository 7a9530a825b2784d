use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

use crate::SyncRunSummary;

/// Write `run_summary.md` and `run_summary.json` into `reports_dir`.
pub async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_summary.md"), render_markdown(summary))
        .await
        .context("writing run_summary.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(())
}

pub fn render_markdown(summary: &SyncRunSummary) -> String {
    let sources = summary
        .sources
        .iter()
        .map(|s| {
            format!(
                "| {} | {} | {} | {} | {} | {} |",
                s.source,
                s.visited,
                s.inserted,
                s.duplicates,
                s.failed,
                s.cursor.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut out = format!(
        "# Ingestion Run Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Schema version: {} ({} applied, {} destructive)\n- Regions in registry: {}\n\n## Sources\n\n| source | visited | inserted | duplicate | failed | cursor |\n|---|---|---|---|---|---|\n{}\n\n## Table Totals\n\n- regions: {}\n- air_quality: {}\n- weather: {}\n- health_records: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.schema_version,
        summary.migrations_applied,
        summary.destructive_migrations,
        summary.regions,
        sources,
        summary.totals.regions,
        summary.totals.air_quality,
        summary.totals.weather,
        summary.totals.health_records,
    );
    if let Some(manifest) = &summary.parquet_manifest {
        out.push_str(&format!("\n- parquet manifest: `{manifest}`\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceSummary;
    use chrono::Utc;
    use envhealth_storage::TableCounts;
    use uuid::Uuid;

    #[test]
    fn markdown_lists_every_source_row() {
        let summary = SyncRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            schema_version: 7,
            migrations_applied: 0,
            destructive_migrations: 0,
            regions: 2,
            sources: vec![SourceSummary {
                source: "weather".into(),
                visited: 2,
                inserted: 1,
                duplicates: 1,
                failed: 0,
                cursor: Some(1),
            }],
            totals: TableCounts {
                regions: 2,
                weather: 1,
                ..Default::default()
            },
            reports_dir: None,
            parquet_manifest: None,
        };
        let md = render_markdown(&summary);
        assert!(md.contains("| weather | 2 | 1 | 1 | 0 | 1 |"));
        assert!(md.contains("- weather: 1"));
        assert!(!md.contains("parquet manifest"));
    }
}
