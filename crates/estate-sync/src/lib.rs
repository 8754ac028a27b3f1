//! Ingestion pipeline orchestration: fetch, normalize, gate, deduplicate, merge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use estate_adapters::{adapter_for_source, normalize, ListingSource};
use estate_core::{Batch, GeoBounds, Target};
use estate_storage::{
    BackoffPolicy, FetchContext, HttpClientConfig, PageArchive, StrategyChain, TableError,
    TableStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod coordinator;
pub mod dedup;
pub mod merge;
pub mod monitor;
pub mod outcome;
pub mod quality;

pub use coordinator::{CoordinatorConfig, FetchCoordinator, FetchReport, FetchTally};
pub use dedup::deduplicate;
pub use merge::{plan_upsert, MergeEngine, MergeOutcome, UpsertPlan};
pub use monitor::{HealthMonitor, HealthState, MonitorConfig};
pub use outcome::{read_latest_outcome, ReportWriter, RunError, RunOutcome, RunStatus};
pub use quality::{QualityGate, QualityReport, QualityThresholds, Verdict};

pub const CRATE_NAME: &str = "estate-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{phase} phase: {failed} of {total} targets failed (threshold {threshold})")]
    BatchFailure {
        phase: &'static str,
        failed: usize,
        total: usize,
        threshold: f64,
    },
    #[error("quality gate failed: {}", .0.describe_misses())]
    QualityFailure(Box<QualityReport>),
    #[error("table writer still contended after {attempts} attempts")]
    MergeConflict {
        attempts: usize,
        #[source]
        source: TableError,
    },
    #[error("table storage unavailable: {0}")]
    StorageUnavailable(#[from] TableError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BatchFailure { .. } => "batch_failure",
            Self::QualityFailure(_) => "quality_failure",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Config(_) => "config",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub pipeline_config: PathBuf,
    pub table_dir: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_raw: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            pipeline_config: std::env::var("ESTATE_PIPELINE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./pipeline.yaml")),
            table_dir: std::env::var("ESTATE_TABLE_DIR").ok().map(PathBuf::from),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            reports_dir: std::env::var("ESTATE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            archive_raw: env_flag("ESTATE_ARCHIVE_RAW"),
            scheduler_enabled: env_flag("ESTATE_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("ESTATE_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
                    .to_string()
            }),
            http_timeout_secs: std::env::var("ESTATE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub rate_limit_delay_ms: u64,
    pub limit_each_page: usize,
    /// `false` restricts fetching to strategies backed by a browser profile.
    pub headless: bool,
    pub user_profile_path: Option<PathBuf>,
    pub request_timeout_secs: Option<u64>,
    pub target_timeout_secs: u64,
    pub max_retries: usize,
    pub failure_threshold: f64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit_delay_ms: 2_000,
            limit_each_page: 5,
            headless: true,
            user_profile_path: None,
            request_timeout_secs: None,
            target_timeout_secs: 120,
            max_retries: 2,
            failure_threshold: 0.5,
        }
    }
}

fn invalid(msg: &str) -> Result<(), PipelineError> {
    Err(PipelineError::Config(msg.to_string()))
}

fn default_source() -> String {
    estate_adapters::Nhadat247::SOURCE_ID.to_string()
}

fn default_table_location() -> PathBuf {
    PathBuf::from("./data/listings")
}

/// Orchestrator payload for one pipeline, read from `pipeline.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_source")]
    pub source: String,
    pub search_criteria: Vec<Target>,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub quality: QualityThresholds,
    #[serde(default)]
    pub bounds: GeoBounds,
    #[serde(default = "default_table_location")]
    pub table_location: PathBuf,
}

impl PipelineConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.search_criteria.is_empty() {
            return invalid("search_criteria must name at least one target");
        }
        if adapter_for_source(&self.source).is_none() {
            return Err(PipelineError::Config(format!(
                "no adapter for source {:?}",
                self.source
            )));
        }
        let fetch = &self.fetch;
        if fetch.concurrency == 0 {
            return invalid("fetch.concurrency must be at least 1");
        }
        if fetch.limit_each_page == 0 {
            return invalid("fetch.limit_each_page must be at least 1");
        }
        if !(0.0..=1.0).contains(&fetch.failure_threshold) {
            return invalid("fetch.failure_threshold must be within 0..=1");
        }
        if !fetch.headless && fetch.user_profile_path.is_none() {
            return invalid("fetch.headless = false requires fetch.user_profile_path");
        }
        let q = &self.quality;
        for (name, value) in [
            ("quality.completeness", q.completeness),
            ("quality.duplicate", q.duplicate),
            ("quality.price_validity", q.price_validity),
            ("quality.coordinate_validity", q.coordinate_validity),
            ("quality.warn_margin", q.warn_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config(format!("{name} must be within 0..=1")));
            }
        }
        if q.price_min >= q.price_max {
            return invalid("quality.price_min must be below quality.price_max");
        }
        let b = &self.bounds;
        if b.min_lat >= b.max_lat || b.min_lon >= b.max_lon {
            return invalid("bounds must have min below max on both axes");
        }
        Ok(())
    }

    pub fn http_client_config(&self, sync: &SyncConfig) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(
                self.fetch
                    .request_timeout_secs
                    .unwrap_or(sync.http_timeout_secs),
            ),
            user_agent: Some(sync.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.fetch.max_retries,
                ..BackoffPolicy::default()
            },
            browser_profile: self.fetch.user_profile_path.clone(),
        }
    }

    pub fn fetch_context(&self, http: &HttpClientConfig) -> FetchContext {
        FetchContext {
            headers: Vec::new(),
            timeout: http.timeout,
            requires_browser_profile: !self.fetch.headless,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            concurrency: self.fetch.concurrency,
            rate_limit_delay: Duration::from_millis(self.fetch.rate_limit_delay_ms),
            target_timeout: Duration::from_secs(self.fetch.target_timeout_secs),
            failure_threshold: self.fetch.failure_threshold,
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    pipeline: PipelineConfig,
    source: Box<dyn ListingSource>,
    coordinator: FetchCoordinator,
    gate: QualityGate,
    engine: MergeEngine,
    reports: ReportWriter,
    archive: Option<PageArchive>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, pipeline: PipelineConfig) -> Result<Self> {
        let http = pipeline.http_client_config(&config);
        let chain = StrategyChain::from_config(&http).context("building fetch strategy chain")?;
        Self::with_chain(config, pipeline, chain)
    }

    pub fn with_chain(
        config: SyncConfig,
        pipeline: PipelineConfig,
        chain: StrategyChain,
    ) -> Result<Self> {
        pipeline.validate()?;
        let source = adapter_for_source(&pipeline.source)
            .ok_or_else(|| PipelineError::Config(format!("no adapter for {}", pipeline.source)))?;
        let http = pipeline.http_client_config(&config);
        let coordinator = FetchCoordinator::new(
            chain,
            pipeline.fetch_context(&http),
            pipeline.coordinator_config(),
        );
        let gate = QualityGate::new(pipeline.quality, pipeline.bounds);
        let table_root = config
            .table_dir
            .clone()
            .unwrap_or_else(|| pipeline.table_location.clone());
        let engine = MergeEngine::new(TableStore::open(table_root));
        let reports = ReportWriter::new(config.reports_dir.clone());
        let archive = config
            .archive_raw
            .then(|| PageArchive::new(config.artifacts_dir.join("raw")));
        Ok(Self {
            config,
            pipeline,
            source,
            coordinator,
            gate,
            engine,
            reports,
            archive,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn store(&self) -> &TableStore {
        self.engine.store()
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    /// Run the pipeline once and write its reports. Pipeline failures are carried in the
    /// returned outcome; only report-writing problems are returned as errors.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        let mut outcome = RunOutcome::start(Utc::now());
        info!(
            run_id = %outcome.run_id,
            source = self.source.source_id(),
            targets = self.pipeline.search_criteria.len(),
            "sync run started"
        );

        let error = match self.execute(&mut outcome).await {
            Ok(()) => None,
            Err(err) => {
                error!(run_id = %outcome.run_id, kind = err.kind(), error = %err, "sync run aborted");
                Some(RunError {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                })
            }
        };
        outcome.finish(Utc::now(), error);

        let run_dir = self.reports.write(&outcome).await?;
        info!(
            run_id = %outcome.run_id,
            status = ?outcome.status,
            inserted = outcome.records_ingested,
            updated = outcome.records_updated,
            version = ?outcome.table_version,
            reports = %run_dir.display(),
            "sync run finished"
        );
        Ok(outcome)
    }

    async fn execute(&self, outcome: &mut RunOutcome) -> Result<(), PipelineError> {
        let collected_at = outcome.started_at;
        let targets = &self.pipeline.search_criteria;
        outcome.search_targets = targets.len();

        let mut listing_urls = Vec::new();
        let mut listing_targets = Vec::new();
        for target in targets {
            for url in self.source.listing_urls(target) {
                info!(target = %target.mapping_key(), url = %url, "listing page queued");
                listing_urls.push(url);
                listing_targets.push(target);
            }
        }
        let listing = self.coordinator.fetch_all(listing_urls).await;
        outcome.listing_pages = listing.tally();
        self.check_phase("listing", &listing)?;
        self.archive_pages(&listing, collected_at).await;

        let mut seen = HashSet::new();
        let mut detail_urls = Vec::new();
        let mut detail_targets = Vec::new();
        for (result, target) in listing.results.iter().zip(listing_targets) {
            let Some(page) = result.page() else { continue };
            match self
                .source
                .parse_listing(&page.body, self.pipeline.fetch.limit_each_page)
            {
                Ok(links) => {
                    for link in links {
                        if seen.insert(link.clone()) {
                            detail_urls.push(link);
                            detail_targets.push(target);
                        } else {
                            outcome.repeated_links += 1;
                        }
                    }
                }
                Err(err) => {
                    outcome.parse_failures += 1;
                    warn!(url = %page.url, error = %err, "listing page could not be parsed");
                }
            }
        }

        let details = self.coordinator.fetch_all(detail_urls).await;
        outcome.detail_pages = details.tally();
        self.check_phase("detail", &details)?;
        self.archive_pages(&details, collected_at).await;

        let mut batch: Batch = Vec::with_capacity(details.results.len());
        for (result, target) in details.results.iter().zip(detail_targets) {
            let Some(page) = result.page() else { continue };
            let record = self
                .source
                .parse_detail(&page.url, &page.body)
                .and_then(|raw| {
                    normalize(
                        &raw,
                        self.source.base_url(),
                        &self.pipeline.bounds,
                        collected_at,
                        Some(target.clone()),
                    )
                });
            match record {
                Ok(record) => batch.push(record),
                Err(err) => {
                    outcome.parse_failures += 1;
                    warn!(url = %page.url, error = %err, "skipping unparseable listing");
                }
            }
        }
        outcome.parsed_records = batch.len();

        let report = self.gate.evaluate_fetched(&batch, outcome.repeated_links);
        outcome.quality = Some(report.clone());
        match report.verdict {
            Verdict::Pass => info!(records = report.records, "quality gate passed"),
            Verdict::Warn => warn!(misses = %report.describe_misses(), "quality gate warning"),
            Verdict::Fail => return Err(PipelineError::QualityFailure(Box::new(report))),
        }

        let batch = deduplicate(batch);
        outcome.unique_records = batch.len();

        let merged = self.engine.merge(&batch).await?;
        outcome.records_ingested = merged.inserted;
        outcome.records_updated = merged.updated;
        outcome.records_unchanged = merged.unchanged;
        outcome.table_version = Some(merged.version);
        Ok(())
    }

    fn check_phase(&self, phase: &'static str, report: &FetchReport) -> Result<(), PipelineError> {
        let threshold = self.pipeline.fetch.failure_threshold;
        let tally = report.tally();
        if report.exceeds(threshold) {
            return Err(PipelineError::BatchFailure {
                phase,
                failed: tally.failed,
                total: tally.total,
                threshold,
            });
        }
        info!(phase, fetched = tally.fetched, failed = tally.failed, "fetch phase complete");
        Ok(())
    }

    async fn archive_pages(&self, report: &FetchReport, fetched_at: DateTime<Utc>) {
        let Some(archive) = &self.archive else { return };
        for page in report.successes().filter_map(|r| r.page()) {
            if let Err(err) = archive
                .store_page(fetched_at, self.source.source_id(), page.body.as_bytes())
                .await
            {
                warn!(url = %page.url, error = %err, "failed to archive raw page");
            }
        }
    }

    /// Cron job that triggers [`SyncPipeline::run_once`], when the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(outcome) if outcome.is_failed() => {
                        warn!(run_id = %outcome.run_id, "scheduled sync run failed")
                    }
                    Ok(outcome) => info!(run_id = %outcome.run_id, "scheduled sync run succeeded"),
                    Err(err) => error!(error = %err, "scheduled sync run could not report"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Score a committed table version (the current one when `version` is `None`).
pub async fn evaluate_table(
    store: &TableStore,
    gate: &QualityGate,
    version: Option<u64>,
) -> Result<QualityReport, PipelineError> {
    let snapshot = match version {
        Some(v) => store.snapshot_at(v).await?,
        None => store.snapshot().await?,
    };
    Ok(gate.evaluate(&snapshot.to_records()))
}

pub async fn run_sync_once_from_env() -> Result<RunOutcome> {
    let config = SyncConfig::from_env();
    let pipeline = PipelineConfig::load(&config.pipeline_config).await?;
    SyncPipeline::new(config, pipeline)?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use estate_storage::{FetchError, FetchStrategy, FetchedPage};
    use tempfile::{tempdir, TempDir};

    const PIPELINE_YAML: &str = r#"
search_criteria:
  - city: ha-noi
    propertyType: nha-rieng
    rentOrBuy: buy
    radius: 0
fetch:
  rate_limit_delay_ms: 0
  target_timeout_secs: 5
quality:
  completeness: 0.9
"#;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/nhadat247/sample")
            .join(name);
        std::fs::read_to_string(&path).unwrap()
    }

    /// Serves the listing fixture for listing URLs and `detail` for every `-pid` URL.
    struct FixtureSite {
        listing: String,
        detail: String,
        block_listings: bool,
    }

    #[async_trait]
    impl FetchStrategy for FixtureSite {
        fn name(&self) -> &str {
            "fixture"
        }

        async fn fetch(&self, url: &str, _ctx: &FetchContext) -> Result<FetchedPage, FetchError> {
            let is_detail = url.contains("-pid");
            if !is_detail && self.block_listings {
                return Err(FetchError::Blocked {
                    url: url.to_string(),
                    status: Some(403),
                    reason: "forbidden".into(),
                    retryable: false,
                });
            }
            Ok(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                body: if is_detail { self.detail.clone() } else { self.listing.clone() },
                strategy: "fixture".into(),
            })
        }
    }

    fn pipeline(dir: &TempDir, site: FixtureSite) -> SyncPipeline {
        let config = SyncConfig {
            pipeline_config: dir.path().join("pipeline.yaml"),
            table_dir: Some(dir.path().join("table")),
            artifacts_dir: dir.path().join("artifacts"),
            reports_dir: dir.path().join("reports"),
            archive_raw: true,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".into(),
            user_agent: "estate-test/0.1".into(),
            http_timeout_secs: 5,
        };
        let chain = StrategyChain::new(BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        })
        .with_strategy(Arc::new(site));
        let pipeline: PipelineConfig = serde_yaml::from_str(PIPELINE_YAML).unwrap();
        SyncPipeline::with_chain(config, pipeline, chain).unwrap()
    }

    fn site(detail: String) -> FixtureSite {
        FixtureSite {
            listing: fixture("listing.html"),
            detail,
            block_listings: false,
        }
    }

    #[test]
    fn yaml_sections_fall_back_to_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(PIPELINE_YAML).unwrap();
        assert_eq!(config.source, "nhadat247");
        assert_eq!(config.fetch.concurrency, 1);
        assert_eq!(config.fetch.limit_each_page, 5);
        assert_eq!(config.fetch.rate_limit_delay_ms, 0);
        assert_eq!(config.quality.duplicate, 0.05);
        assert_eq!(config.bounds, GeoBounds::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn visible_browser_without_profile_is_rejected() {
        let mut config: PipelineConfig = serde_yaml::from_str(PIPELINE_YAML).unwrap();
        config.fetch.headless = false;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.fetch.user_profile_path = Some(PathBuf::from("/tmp/profile"));
        assert!(config.validate().is_ok());
        let http = config.http_client_config(&SyncConfig::from_env());
        assert!(config.fetch_context(&http).requires_browser_profile);

        config.search_criteria.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn run_commits_new_listings_and_writes_reports() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir, site(fixture("detail.html")));

        let outcome = pipeline.run_once().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
        assert_eq!(outcome.listing_pages, FetchTally { total: 1, fetched: 1, failed: 0 });
        assert_eq!(outcome.detail_pages, FetchTally { total: 4, fetched: 4, failed: 0 });
        assert_eq!(outcome.records_ingested, 4);
        assert_eq!(outcome.table_version, Some(1));
        assert_eq!(outcome.quality_verdict(), Some(Verdict::Pass));

        let table = pipeline.store().snapshot().await.unwrap();
        assert_eq!(table.len(), 4);
        let record = table.to_records().remove(0);
        assert_eq!(record.search.as_ref().map(|t| t.city.as_str()), Some("ha-noi"));

        let latest = read_latest_outcome(&dir.path().join("reports")).await.unwrap().unwrap();
        assert_eq!(latest.run_id, outcome.run_id);
        assert!(dir.path().join("artifacts/raw").exists());

        let again = pipeline.run_once().await.unwrap();
        assert_eq!(again.table_version, Some(2));
        assert_eq!(again.records_ingested, 0);
        assert_eq!(again.records_updated + again.records_unchanged, 4);
        assert_eq!(pipeline.store().snapshot().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn blocked_listing_phase_aborts_before_merge() {
        let dir = tempdir().unwrap();
        let mut site = site(fixture("detail.html"));
        site.block_listings = true;
        let pipeline = pipeline(&dir, site);

        let outcome = pipeline.run_once().await.unwrap();
        assert!(outcome.is_failed());
        assert_eq!(outcome.error.as_ref().unwrap().kind, "batch_failure");
        assert_eq!(outcome.listing_pages.failed, 1);
        assert_eq!(pipeline.store().current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_quality_gate_commits_nothing() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir, site("<html><h1>Chỉ có tiêu đề</h1></html>".into()));

        let outcome = pipeline.run_once().await.unwrap();
        assert!(outcome.is_failed());
        assert_eq!(outcome.error.as_ref().unwrap().kind, "quality_failure");
        assert_eq!(outcome.parsed_records, 4);
        assert_eq!(outcome.quality_verdict(), Some(Verdict::Fail));
        assert_eq!(pipeline.store().current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlapping_targets_count_repeated_links_as_duplicates() {
        let dir = tempdir().unwrap();
        let mut pipeline = pipeline(&dir, site(fixture("detail.html")));
        let mut second = pipeline.pipeline.search_criteria[0].clone();
        second.city = "ho-chi-minh".into();
        pipeline.pipeline.search_criteria.push(second);
        assert_eq!(pipeline.pipeline().search_criteria.len(), 2);

        let outcome = pipeline.run_once().await.unwrap();
        assert_eq!(outcome.listing_pages.fetched, 2);
        assert_eq!(outcome.detail_pages.total, 4);
        assert_eq!(outcome.repeated_links, 4);
        let quality = outcome.quality.as_ref().unwrap();
        assert_eq!(quality.duplicate_ratio, 0.5);
        assert_eq!(outcome.error.as_ref().unwrap().kind, "quality_failure");
        assert_eq!(pipeline.store().current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn committed_table_can_be_scored() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir, site(fixture("detail.html")));
        pipeline.run_once().await.unwrap();

        let report = evaluate_table(pipeline.store(), pipeline.gate(), Some(1))
            .await
            .unwrap();
        assert_eq!(report.records, 4);
        assert_eq!(report.verdict, Verdict::Pass);
    }
}
