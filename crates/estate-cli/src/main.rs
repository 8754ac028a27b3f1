use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use estate_storage::TableStore;
use estate_sync::{
    evaluate_table, HealthMonitor, MonitorConfig, PipelineConfig, QualityGate, SyncConfig,
    SyncPipeline, Verdict,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "estate_cli=info,estate_sync=info,estate_storage=info,estate_adapters=info,estate_web=info";

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Listing ingestion pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion pipeline once.
    Sync,
    /// Probe endpoints and the latest run outcome, alerting at most once per condition per day.
    Monitor {
        #[arg(long)]
        once: bool,
    },
    /// Serve the read-only HTTP surface.
    Serve,
    /// Run the cron-driven sync and the monitor loop in one process.
    Schedule,
    /// List committed table versions.
    Versions,
    /// Score a committed table version with the quality gate.
    Quality {
        #[arg(long)]
        version: Option<u64>,
    },
}

async fn load_pipeline(sync: &SyncConfig) -> Result<PipelineConfig> {
    PipelineConfig::load(&sync.pipeline_config)
        .await
        .context("loading pipeline configuration")
}

fn table_store(sync: &SyncConfig, pipeline: &PipelineConfig) -> TableStore {
    TableStore::open(
        sync.table_dir
            .clone()
            .unwrap_or_else(|| pipeline.table_location.clone()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let outcome = estate_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} inserted={} updated={} unchanged={} version={}",
                if outcome.is_failed() { "failed" } else { "complete" },
                outcome.run_id,
                outcome.records_ingested,
                outcome.records_updated,
                outcome.records_unchanged,
                outcome
                    .table_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".into()),
            );
            if let Some(err) = &outcome.error {
                anyhow::bail!("{}: {}", err.kind, err.message);
            }
        }
        Commands::Monitor { once } => {
            let config = MonitorConfig::from_env();
            let monitor = HealthMonitor::from_config(&config)?;
            if once {
                let state = monitor.run_persisted_cycle(&config.state_path).await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                info!(interval_secs = config.interval.as_secs(), "monitor loop starting");
                tokio::select! {
                    res = monitor.run_forever(&config.state_path, config.interval) => res?,
                    _ = tokio::signal::ctrl_c() => info!("monitor stopping"),
                }
            }
        }
        Commands::Serve => {
            estate_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let sync = SyncConfig::from_env();
            let pipeline = load_pipeline(&sync).await?;
            let sync_pipeline = Arc::new(SyncPipeline::new(sync, pipeline)?);
            let scheduler = sync_pipeline.maybe_build_scheduler().await?;
            match &scheduler {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!(cron = %sync_pipeline.config().sync_cron, "sync scheduler started");
                }
                None => info!("ESTATE_SCHEDULER_ENABLED is off; only the monitor will run"),
            }

            let monitor_config = MonitorConfig::from_env();
            let monitor = HealthMonitor::from_config(&monitor_config)?;
            tokio::select! {
                res = monitor.run_forever(&monitor_config.state_path, monitor_config.interval) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Versions => {
            let sync = SyncConfig::from_env();
            let pipeline = load_pipeline(&sync).await?;
            let store = table_store(&sync, &pipeline);
            for entry in store.versions().await? {
                println!(
                    "v{} parent={} committed_at={} records={} inserted={} updated={} unchanged={} segments={}",
                    entry.version,
                    entry
                        .parent
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".into()),
                    entry.committed_at,
                    entry.record_count,
                    entry.metrics.inserted,
                    entry.metrics.updated,
                    entry.metrics.unchanged,
                    entry.segments.len(),
                );
            }
        }
        Commands::Quality { version } => {
            let sync = SyncConfig::from_env();
            let pipeline = load_pipeline(&sync).await?;
            let store = table_store(&sync, &pipeline);
            let gate = QualityGate::new(pipeline.quality, pipeline.bounds);
            let report = evaluate_table(&store, &gate, version).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.verdict == Verdict::Fail {
                anyhow::bail!("quality gate failed: {}", report.describe_misses());
            }
        }
    }

    Ok(())
}
