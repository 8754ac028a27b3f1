//! Structured run outcome and the report files written for each run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use estate_storage::write_atomic;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::coordinator::FetchTally;
use crate::quality::{QualityReport, Verdict};

pub const LATEST_OUTCOME_FILE: &str = "latest_outcome.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
}

/// What one pipeline run did. Aborted runs keep the counts reached before the abort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub search_targets: usize,
    pub listing_pages: FetchTally,
    pub detail_pages: FetchTally,
    /// Listing links already queued by an earlier page or target in the same run.
    #[serde(default)]
    pub repeated_links: usize,
    pub parsed_records: usize,
    pub parse_failures: usize,
    pub unique_records: usize,
    pub records_ingested: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub table_version: Option<u64>,
    pub quality: Option<QualityReport>,
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            duration_ms: 0,
            status: RunStatus::Running,
            search_targets: 0,
            listing_pages: FetchTally::default(),
            detail_pages: FetchTally::default(),
            repeated_links: 0,
            parsed_records: 0,
            parse_failures: 0,
            unique_records: 0,
            records_ingested: 0,
            records_updated: 0,
            records_unchanged: 0,
            table_version: None,
            quality: None,
            error: None,
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>, error: Option<RunError>) {
        self.finished_at = Some(finished_at);
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        self.status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.error = error;
    }

    pub fn quality_verdict(&self) -> Option<Verdict> {
        self.quality.as_ref().map(|q| q.verdict)
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

pub fn render_daily_brief(outcome: &RunOutcome) -> String {
    let verdict = outcome
        .quality_verdict()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "not evaluated".to_string());
    let mut brief = format!(
        "# Listing Ingestion Daily Brief\n\n\
         - Run ID: `{}`\n\
         - Status: {:?}\n\
         - Started: {}\n\
         - Duration: {} ms\n\
         - Search targets: {}\n\
         - Listing pages: {} fetched / {} failed\n\
         - Detail pages: {} fetched / {} failed\n\
         - Records parsed: {} ({} parse failures, {} unique, {} repeated links skipped)\n\
         - Inserted: {}, updated: {}, unchanged: {}\n\
         - Table version: {}\n\
         - Quality verdict: {}\n",
        outcome.run_id,
        outcome.status,
        outcome.started_at,
        outcome.duration_ms,
        outcome.search_targets,
        outcome.listing_pages.fetched,
        outcome.listing_pages.failed,
        outcome.detail_pages.fetched,
        outcome.detail_pages.failed,
        outcome.parsed_records,
        outcome.parse_failures,
        outcome.unique_records,
        outcome.repeated_links,
        outcome.records_ingested,
        outcome.records_updated,
        outcome.records_unchanged,
        outcome
            .table_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unchanged".to_string()),
        verdict,
    );
    if let Some(quality) = &outcome.quality {
        brief.push_str(&format!(
            "\n## Quality\n- completeness: {:.4}\n- duplicate ratio: {:.4}\n- price validity: {:.4}\n- coordinate validity: {:.4}\n",
            quality.completeness,
            quality.duplicate_ratio,
            quality.price_validity,
            quality.coordinate_validity,
        ));
    }
    if let Some(error) = &outcome.error {
        brief.push_str(&format!("\n## Error\n- {}: {}\n", error.kind, error.message));
    }
    brief
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `<run_id>/run_outcome.json` and `<run_id>/daily_brief.md`, then swap
    /// `latest_outcome.json` to this run.
    pub async fn write(&self, outcome: &RunOutcome) -> Result<PathBuf> {
        let run_dir = self.root.join(outcome.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(outcome).context("serializing run outcome")?;
        fs::write(run_dir.join("run_outcome.json"), &json)
            .await
            .context("writing run_outcome.json")?;
        fs::write(run_dir.join("daily_brief.md"), render_daily_brief(outcome))
            .await
            .context("writing daily_brief.md")?;

        let latest = self.root.join(LATEST_OUTCOME_FILE);
        write_atomic(&latest, &json)
            .await
            .with_context(|| format!("replacing {}", latest.display()))?;
        Ok(run_dir)
    }
}

pub async fn read_latest_outcome(reports_dir: &Path) -> Result<Option<RunOutcome>> {
    let path = reports_dir.join(LATEST_OUTCOME_FILE);
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let outcome = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(outcome))
}
