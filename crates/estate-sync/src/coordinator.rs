//! Bounded worker pool that runs every target through the fetch strategy chain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use estate_storage::{FetchContext, FetchError, FetchResult, StrategyChain};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Workers in flight at once. Clamped to at least one.
    pub concurrency: usize,
    /// Pause a worker takes between two consecutive targets.
    pub rate_limit_delay: Duration,
    /// Budget for one target across every strategy and retry.
    pub target_timeout: Duration,
    pub failure_threshold: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit_delay: Duration::from_millis(2_000),
            target_timeout: Duration::from_secs(120),
            failure_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTally {
    pub total: usize,
    pub fetched: usize,
    pub failed: usize,
}

/// One result per requested target, in request order.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub results: Vec<FetchResult>,
}

impl FetchReport {
    pub fn tally(&self) -> FetchTally {
        let fetched = self.results.iter().filter(|r| r.is_success()).count();
        FetchTally {
            total: self.results.len(),
            fetched,
            failed: self.results.len() - fetched,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let tally = self.tally();
        if tally.total == 0 {
            0.0
        } else {
            tally.failed as f64 / tally.total as f64
        }
    }

    /// The batch fails only when the failure rate is strictly above the threshold.
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.failure_rate() > threshold
    }

    pub fn successes(&self) -> impl Iterator<Item = &FetchResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FetchResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

#[derive(Clone)]
pub struct FetchCoordinator {
    chain: StrategyChain,
    context: FetchContext,
    config: CoordinatorConfig,
}

impl FetchCoordinator {
    pub fn new(chain: StrategyChain, context: FetchContext, config: CoordinatorConfig) -> Self {
        Self {
            chain,
            context,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Attempt every target. Individual failures are recorded, never dropped, so the
    /// report always holds exactly `targets.len()` results.
    pub async fn fetch_all(&self, targets: Vec<String>) -> FetchReport {
        let total = targets.len();
        if total == 0 {
            return FetchReport {
                results: Vec::new(),
            };
        }
        let workers = self.config.concurrency.max(1).min(total);
        info!(targets = total, workers, "dispatching fetch targets");

        let (job_tx, job_rx) = mpsc::channel::<(usize, String)>(total);
        for job in targets.iter().cloned().enumerate() {
            // Capacity equals the job count, so this never waits.
            let _ = job_tx.send(job).await;
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, FetchResult)>();

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let chain = self.chain.clone();
            let context = self.context.clone();
            let config = self.config.clone();
            handles.push(tokio::spawn(async move {
                let mut first = true;
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some((index, url)) = next else { break };
                    if !first && !config.rate_limit_delay.is_zero() {
                        tokio::time::sleep(config.rate_limit_delay).await;
                    }
                    first = false;

                    let started = Instant::now();
                    let result = match tokio::time::timeout(
                        config.target_timeout,
                        chain.fetch(&url, &context),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            let elapsed = started.elapsed();
                            FetchResult::failed(url.clone(), FetchError::timeout(&url, elapsed), elapsed)
                        }
                    };
                    match result.error() {
                        None => debug!(worker, target = %url, "target fetched"),
                        Some(err) => warn!(worker, target = %url, kind = ?err.kind(), error = %err, "target failed"),
                    }
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut slots: Vec<Option<FetchResult>> = (0..total).map(|_| None).collect();
        while let Some((index, result)) = result_rx.recv().await {
            slots[index] = Some(result);
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "fetch worker aborted");
            }
        }

        let results = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    let error = FetchError::Network {
                        url: url.clone(),
                        reason: "fetch worker aborted before completing target".to_string(),
                        retryable: false,
                    };
                    FetchResult::failed(url, error, Duration::ZERO)
                })
            })
            .collect();
        let report = FetchReport { results };
        let tally = report.tally();
        info!(
            total = tally.total,
            fetched = tally.fetched,
            failed = tally.failed,
            "fetch phase finished"
        );
        report
    }
}
