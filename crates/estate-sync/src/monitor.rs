//! Health and alert monitor.
//!
//! Each cycle probes the configured endpoints, reads the latest run outcome and raises
//! at most one alert per condition per UTC calendar day. Alert suppression lives in an
//! explicit [`HealthState`] that is threaded through cycles and persisted between them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use estate_storage::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

use crate::outcome::{read_latest_outcome, RunOutcome, RunStatus};
use crate::quality::Verdict;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub storage_health_url: Option<String>,
    pub orchestrator_health_url: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub state_path: PathBuf,
    pub reports_dir: PathBuf,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            storage_health_url: non_empty("STORAGE_HEALTH_URL"),
            orchestrator_health_url: non_empty("ORCHESTRATOR_HEALTH_URL"),
            alert_webhook_url: non_empty("ALERT_WEBHOOK_URL"),
            state_path: std::env::var("HEALTH_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./health_state.json")),
            reports_dir: std::env::var("ESTATE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            interval: Duration::from_secs(secs("MONITOR_INTERVAL_SECS", 300)),
            probe_timeout: Duration::from_secs(secs("MONITOR_PROBE_TIMEOUT_SECS", 5)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    EndpointDown { endpoint: String },
    PipelineFailed,
    QualityGateFailed,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointDown { endpoint } => write!(f, "endpoint_down:{endpoint}"),
            Self::PipelineFailed => f.write_str("pipeline_failed"),
            Self::QualityGateFailed => f.write_str("quality_gate_failed"),
        }
    }
}

impl Condition {
    /// Key that suppresses repeat alerts for this condition until `day` ends.
    pub fn alert_key(&self, day: NaiveDate) -> String {
        format!("{self}:{}", day.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub key: String,
    pub condition: Condition,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub up: bool,
    pub checked_at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeDigest {
    pub run_id: String,
    pub status: RunStatus,
    pub quality_verdict: Option<Verdict>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&RunOutcome> for OutcomeDigest {
    fn from(outcome: &RunOutcome) -> Self {
        Self {
            run_id: outcome.run_id.to_string(),
            status: outcome.status,
            quality_verdict: outcome.quality_verdict(),
            finished_at: outcome.finished_at,
            error: outcome
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind, e.message)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointStatus>,
    #[serde(default)]
    pub last_outcome: Option<OutcomeDigest>,
    #[serde(default)]
    pub sent_alerts: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl HealthState {
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing health state {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading health state {}", path.display())),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing health state")?;
        write_atomic(path, &bytes)
            .await
            .with_context(|| format!("writing health state {}", path.display()))
    }

    pub fn is_alerted(&self, condition: &Condition, day: NaiveDate) -> bool {
        self.sent_alerts.contains(&condition.alert_key(day))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub up: bool,
    pub detail: Option<String>,
}

/// What one cycle observed, independent of how it was gathered.
#[derive(Debug, Clone)]
pub struct Observation {
    pub at: DateTime<Utc>,
    pub endpoints: Vec<(String, ProbeResult)>,
    pub outcome: Option<OutcomeDigest>,
}

/// Fold an observation into the state and list the alerts that are due.
/// Keys from earlier days are dropped first, which is what re-arms a condition
/// at the day boundary. Due alerts are not yet recorded as sent.
pub fn evaluate(mut state: HealthState, observation: &Observation) -> (HealthState, Vec<Alert>) {
    let today = observation.at.date_naive();
    let suffix = format!(":{}", today.format("%Y-%m-%d"));
    state.sent_alerts.retain(|key| key.ends_with(&suffix));

    let mut active = Vec::new();
    for (name, probe) in &observation.endpoints {
        state.endpoints.insert(
            name.clone(),
            EndpointStatus {
                up: probe.up,
                checked_at: observation.at,
                detail: probe.detail.clone(),
            },
        );
        if !probe.up {
            let detail = probe.detail.as_deref().unwrap_or("no response");
            active.push((
                Condition::EndpointDown {
                    endpoint: name.clone(),
                },
                format!("{name} endpoint is down: {detail}"),
            ));
        }
    }

    if let Some(digest) = &observation.outcome {
        if digest.status == RunStatus::Failed {
            active.push((
                Condition::PipelineFailed,
                format!(
                    "pipeline run {} failed: {}",
                    digest.run_id,
                    digest.error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }
        if digest.quality_verdict == Some(Verdict::Fail) {
            active.push((
                Condition::QualityGateFailed,
                format!("quality gate failed for run {}", digest.run_id),
            ));
        }
    }
    state.last_outcome = observation.outcome.clone();
    state.updated_at = Some(observation.at);

    let alerts = active
        .into_iter()
        .filter_map(|(condition, message)| {
            let key = condition.alert_key(today);
            (!state.sent_alerts.contains(&key)).then(|| Alert {
                key,
                condition,
                message,
                raised_at: observation.at,
            })
        })
        .collect();
    (state, alerts)
}

#[async_trait]
pub trait EndpointProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> ProbeResult;
}

/// GET probe; any non-success status, transport error or timeout counts as down.
pub struct HttpProbe {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building probe client")?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> ProbeResult {
        match self.http.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeResult {
                up: true,
                detail: None,
            },
            Ok(resp) => ProbeResult {
                up: false,
                detail: Some(format!("status {}", resp.status())),
            },
            Err(err) if err.is_timeout() => ProbeResult {
                up: false,
                detail: Some("timed out".to_string()),
            },
            Err(err) => ProbeResult {
                up: false,
                detail: Some(err.to_string()),
            },
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Used when no webhook is configured.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        warn!(key = %alert.key, condition = %alert.condition, "{}", alert.message);
        Ok(())
    }
}

/// Incoming-webhook sink posting a `{"text": ...}` payload.
pub struct WebhookSink {
    webhook_url: String,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            http,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let payload = json!({
            "text": format!(":rotating_light: *Listing ingestion alert*\n{}", alert.message),
            "key": alert.key,
            "condition": alert.condition,
            "raised_at": alert.raised_at,
        });
        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "alert webhook returned non-success");
            anyhow::bail!("alert webhook returned {status}");
        }
        Ok(())
    }
}

pub struct HealthMonitor {
    probes: Vec<Arc<dyn EndpointProbe>>,
    sink: Arc<dyn AlertSink>,
    reports_dir: PathBuf,
}

impl HealthMonitor {
    pub fn new(
        probes: Vec<Arc<dyn EndpointProbe>>,
        sink: Arc<dyn AlertSink>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            probes,
            sink,
            reports_dir: reports_dir.into(),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let mut probes: Vec<Arc<dyn EndpointProbe>> = Vec::new();
        if let Some(url) = &config.storage_health_url {
            probes.push(Arc::new(HttpProbe::new("storage", url, config.probe_timeout)?));
        }
        if let Some(url) = &config.orchestrator_health_url {
            probes.push(Arc::new(HttpProbe::new("orchestrator", url, config.probe_timeout)?));
        }
        let sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => {
                info!("alert webhook enabled");
                Arc::new(WebhookSink::new(url, config.probe_timeout)?)
            }
            None => {
                info!("no ALERT_WEBHOOK_URL set; alerts are logged only");
                Arc::new(LogSink)
            }
        };
        Ok(Self::new(probes, sink, config.reports_dir.clone()))
    }

    async fn observe(&self, at: DateTime<Utc>) -> Observation {
        let mut endpoints = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            endpoints.push((probe.name().to_string(), probe.probe().await));
        }
        let outcome = match read_latest_outcome(&self.reports_dir).await {
            Ok(outcome) => outcome.as_ref().map(OutcomeDigest::from),
            Err(err) => {
                warn!(error = %err, "could not read latest run outcome");
                None
            }
        };
        Observation {
            at,
            endpoints,
            outcome,
        }
    }

    /// One cycle at time `now`. A key is recorded only after its alert was delivered,
    /// so a failed delivery is retried on the next cycle.
    pub async fn run_cycle(&self, state: HealthState, now: DateTime<Utc>) -> HealthState {
        async {
            let observation = self.observe(now).await;
            let (mut state, alerts) = evaluate(state, &observation);
            for alert in alerts {
                match self.sink.send(&alert).await {
                    Ok(()) => {
                        info!(key = %alert.key, "alert sent");
                        state.sent_alerts.insert(alert.key);
                    }
                    Err(err) => warn!(key = %alert.key, error = %err, "alert delivery failed"),
                }
            }
            state
        }
        .instrument(info_span!("monitor_cycle", at = %now))
        .await
    }

    /// Load state, run one cycle, persist state.
    pub async fn run_persisted_cycle(&self, state_path: &Path) -> Result<HealthState> {
        let state = HealthState::load(state_path).await?;
        let state = self.run_cycle(state, Utc::now()).await;
        state.save(state_path).await?;
        Ok(state)
    }

    /// Cycle on a fixed interval until the task is dropped.
    pub async fn run_forever(&self, state_path: &Path, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_persisted_cycle(state_path).await {
                warn!(error = %err, "monitor cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ReportWriter, RunError};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixedProbe {
        name: &'static str,
        up: AtomicBool,
    }

    #[async_trait]
    impl EndpointProbe for FixedProbe {
        fn name(&self) -> &str {
            self.name
        }

        async fn probe(&self) -> ProbeResult {
            let up = self.up.load(Ordering::SeqCst);
            ProbeResult {
                up,
                detail: (!up).then(|| "connection refused".to_string()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Alert>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, alert: &Alert) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("webhook unreachable");
            }
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    fn monitor(reports: &Path, storage_up: bool) -> (HealthMonitor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let probe: Arc<dyn EndpointProbe> = Arc::new(FixedProbe {
            name: "storage",
            up: AtomicBool::new(storage_up),
        });
        (HealthMonitor::new(vec![probe], sink.clone(), reports), sink)
    }

    #[tokio::test]
    async fn persistent_outage_alerts_once_per_day() {
        let dir = tempdir().unwrap();
        let (monitor, sink) = monitor(dir.path(), false);

        let mut state = HealthState::default();
        for hour in [6, 7, 8] {
            state = monitor.run_cycle(state, at(1, hour)).await;
        }
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert!(state.is_alerted(
            &Condition::EndpointDown { endpoint: "storage".into() },
            at(1, 0).date_naive()
        ));

        state = monitor.run_cycle(state, at(2, 0)).await;
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].key, "endpoint_down:storage:2026-03-01");
        assert_eq!(sent[1].key, "endpoint_down:storage:2026-03-02");
        assert_eq!(state.sent_alerts.len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_next_cycle() {
        let dir = tempdir().unwrap();
        let (monitor, sink) = monitor(dir.path(), false);
        sink.failing.store(true, Ordering::SeqCst);

        let state = monitor.run_cycle(HealthState::default(), at(1, 6)).await;
        assert!(state.sent_alerts.is_empty());

        sink.failing.store(false, Ordering::SeqCst);
        let state = monitor.run_cycle(state, at(1, 7)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert_eq!(state.sent_alerts.len(), 1);
    }

    #[tokio::test]
    async fn failed_run_raises_pipeline_and_quality_alerts() {
        let dir = tempdir().unwrap();
        let mut outcome = RunOutcome::start(at(1, 5));
        outcome.quality = Some(crate::quality::QualityReport {
            records: 10,
            completeness: 0.5,
            duplicate_ratio: 0.0,
            price_validity: 1.0,
            coordinate_validity: 1.0,
            verdict: Verdict::Fail,
            misses: Vec::new(),
        });
        outcome.finish(
            at(1, 5),
            Some(RunError {
                kind: "quality_failure".into(),
                message: "completeness 0.5000 vs 0.9000".into(),
            }),
        );
        ReportWriter::new(dir.path()).write(&outcome).await.unwrap();

        let (monitor, sink) = monitor(dir.path(), true);
        let state = monitor.run_cycle(HealthState::default(), at(1, 6)).await;

        let conditions: Vec<Condition> = sink
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.condition.clone())
            .collect();
        assert_eq!(conditions, vec![Condition::PipelineFailed, Condition::QualityGateFailed]);
        assert!(state.endpoints["storage"].up);
        assert_eq!(state.last_outcome.as_ref().unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn suppression_survives_a_restart_through_the_state_file() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("health_state.json");
        let (monitor, sink) = monitor(dir.path(), false);

        let state = monitor.run_cycle(HealthState::default(), at(1, 6)).await;
        state.save(&state_path).await.unwrap();

        let reloaded = HealthState::load(&state_path).await.unwrap();
        assert_eq!(reloaded, state);
        monitor.run_cycle(reloaded, at(1, 9)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn evaluate_prunes_keys_from_previous_days() {
        let mut state = HealthState::default();
        state.sent_alerts.insert("pipeline_failed:2026-02-28".into());
        state.sent_alerts.insert("pipeline_failed:2026-03-01".into());
        let (state, alerts) = evaluate(
            state,
            &Observation {
                at: at(1, 12),
                endpoints: Vec::new(),
                outcome: None,
            },
        );
        assert!(alerts.is_empty());
        assert_eq!(
            state.sent_alerts.into_iter().collect::<Vec<_>>(),
            vec!["pipeline_failed:2026-03-01".to_string()]
        );
    }
}
