//! Upsert merge of a deduplicated batch into the versioned table.

use std::collections::HashMap;
use std::time::Duration;

use estate_core::Record;
use estate_storage::{BackoffPolicy, CommitMetrics, TableError, TableSnapshot, TableStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::PipelineError;

/// Records to write and how they relate to the current version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertPlan {
    pub changed: Vec<Record>,
    pub metrics: CommitMetrics,
}

/// Classify each incoming record against `current`. An incoming record replaces the
/// stored one whole; stored identifiers absent from `batch` are left alone.
pub fn plan_upsert(current: &TableSnapshot, batch: &[Record]) -> UpsertPlan {
    let mut plan = UpsertPlan::default();
    let mut pending: HashMap<&str, usize> = HashMap::new();
    for record in batch {
        if let Some(&slot) = pending.get(record.identifier.as_str()) {
            plan.changed[slot] = record.clone();
            continue;
        }
        match current.get(&record.identifier) {
            Some(stored) if stored == record => plan.metrics.unchanged += 1,
            Some(_) => {
                plan.metrics.updated += 1;
                pending.insert(&record.identifier, plan.changed.len());
                plan.changed.push(record.clone());
            }
            None => {
                plan.metrics.inserted += 1;
                pending.insert(&record.identifier, plan.changed.len());
                plan.changed.push(record.clone());
            }
        }
    }
    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub version: u64,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub record_count: usize,
}

#[derive(Debug, Clone)]
pub struct MergeEngine {
    store: TableStore,
    lock_backoff: BackoffPolicy,
}

impl MergeEngine {
    pub fn new(store: TableStore) -> Self {
        Self {
            store,
            lock_backoff: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
            },
        }
    }

    pub fn with_lock_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.lock_backoff = backoff;
        self
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Commit `batch` as one new table version. Writer contention is retried with
    /// backoff and surfaces as [`PipelineError::MergeConflict`] once retries run out.
    pub async fn merge(&self, batch: &[Record]) -> Result<MergeOutcome, PipelineError> {
        let span = info_span!("merge", records = batch.len());
        self.merge_with_retry(batch).instrument(span).await
    }

    async fn merge_with_retry(&self, batch: &[Record]) -> Result<MergeOutcome, PipelineError> {
        let mut attempt = 0usize;
        loop {
            match self.try_merge(batch).await {
                Ok(outcome) => return Ok(outcome),
                Err(err @ (TableError::WriterLocked { .. } | TableError::VersionConflict { .. })) => {
                    if attempt >= self.lock_backoff.max_retries {
                        return Err(PipelineError::MergeConflict {
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                    let delay = self.lock_backoff.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "table writer busy; retrying merge");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(PipelineError::StorageUnavailable(err)),
            }
        }
    }

    async fn try_merge(&self, batch: &[Record]) -> Result<MergeOutcome, TableError> {
        let writer = self.store.try_begin_write().await?;
        let current = writer.base_snapshot().await?;
        let plan = plan_upsert(&current, batch);
        let entry = writer.commit(&plan.changed, plan.metrics).await?;
        info!(
            version = entry.version,
            inserted = plan.metrics.inserted,
            updated = plan.metrics.updated,
            unchanged = plan.metrics.unchanged,
            "merge committed"
        );
        Ok(MergeOutcome {
            version: entry.version,
            inserted: plan.metrics.inserted,
            updated: plan.metrics.updated,
            unchanged: plan.metrics.unchanged,
            record_count: entry.record_count,
        })
    }
}
