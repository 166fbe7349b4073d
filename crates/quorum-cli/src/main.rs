mod simulate;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quorum_core::telemetry::{init_tracing, LogFormat};
use quorum_orchestrator::{
    CatalogStore, EngineConfig, FileCatalogStore, JsonlOutcomeLog, OrchestrationPattern,
    Orchestrator, OutcomeRecord, Persistence, Task, WorkerFactory,
};
use serde::Deserialize;
use simulate::{SimulatedFactory, SimulatedWorker, SimulatedWorkerConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "quorum", about = "Quorum - capability-based task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quorum.toml")]
    config: PathBuf,

    /// Log output format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the configured simulated workers and run one task
    Simulate {
        /// Task type tag matched against worker capabilities
        task_type: String,
        /// Task priority, 0 to 10
        #[arg(short, long, default_value_t = 5)]
        priority: u8,
        /// Force a pattern (sequential, concurrent, hierarchical, pipeline, scatter-gather, single-shot)
        #[arg(long)]
        pattern: Option<String>,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
        /// Aggregator name for scatter-gather
        #[arg(long)]
        aggregation: Option<String>,
    },
    /// List persisted worker registrations
    Workers,
    /// Summarize the outcome log per worker
    Outcomes {
        /// Also print the most recent records
        #[arg(short, long, default_value_t = 0)]
        limit: usize,
    },
}

#[derive(Deserialize, Default)]
struct QuorumConfig {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    workers: Vec<SimulatedWorkerConfig>,
}

fn load_config(path: &Path) -> anyhow::Result<QuorumConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(QuorumConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: QuorumConfig = toml::from_str(&raw)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    config.engine.validate()?;
    Ok(config)
}

fn parse_pattern(name: &str) -> anyhow::Result<OrchestrationPattern> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .with_context(|| format!("Unknown pattern '{name}'"))
}

fn data_dir(config: &QuorumConfig) -> anyhow::Result<&Path> {
    config
        .engine
        .data_dir
        .as_deref()
        .context("No data_dir configured under [engine]")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_format, "info");

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Simulate {
            task_type,
            priority,
            pattern,
            payload,
            aggregation,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let mut task = Task::new(task_type, payload).with_priority(priority);
            if let Some(name) = &pattern {
                task = task.with_pattern(parse_pattern(name)?);
            }
            if let Some(name) = aggregation {
                task = task.with_aggregation(name);
            }
            run_simulation(config, task).await?;
        }
        Commands::Workers => {
            let store = FileCatalogStore::new(data_dir(&config)?.join("workers")).await?;
            let descriptors = store.load_all().await?;
            if descriptors.is_empty() {
                println!("No persisted workers.");
            }
            for descriptor in descriptors {
                println!(
                    "{} ({}) priority={} max_concurrent={}",
                    descriptor.id,
                    descriptor.kind,
                    descriptor.priority,
                    descriptor.resources.max_concurrent_tasks
                );
                for cap in &descriptor.capabilities {
                    println!(
                        "  {} [{}] confidence={:.2} success_rate={:.3}",
                        cap.name,
                        cap.category_key(),
                        cap.confidence,
                        cap.success_rate
                    );
                }
            }
        }
        Commands::Outcomes { limit } => {
            let log = JsonlOutcomeLog::new(data_dir(&config)?.join("outcomes.jsonl")).await?;
            let records = log.read_all().await?;
            print_outcome_summary(&records, limit);
        }
    }

    Ok(())
}

async fn run_simulation(config: QuorumConfig, task: Task) -> anyhow::Result<()> {
    let factory: Arc<dyn WorkerFactory> = Arc::new(SimulatedFactory::new(&config.workers));
    let persistence = match &config.engine.data_dir {
        Some(dir) => Persistence::file_backed(dir, Some(factory)).await?,
        None => Persistence::default(),
    };
    let engine = Orchestrator::with_persistence(config.engine.clone(), persistence)?;
    engine.start().await?;

    for worker in &config.workers {
        if engine.catalog().contains(&worker.id) {
            continue;
        }
        engine
            .register_worker(Arc::new(SimulatedWorker::from_config(worker)))
            .await
            .with_context(|| format!("Failed to register worker '{}'", worker.id))?;
    }
    info!(workers = engine.catalog().len(), task_type = %task.task_type, "Submitting task");

    let result = engine.submit_task(task).await;
    engine.stop().await?;
    let outcome = result?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

#[derive(Default)]
struct WorkerTally {
    wins: usize,
    confidence_sum: f64,
}

fn print_outcome_summary(records: &[OutcomeRecord], limit: usize) {
    let failed = records.iter().filter(|r| !r.success).count();
    println!(
        "{} outcome(s): {} succeeded, {} failed",
        records.len(),
        records.len() - failed,
        failed
    );

    let mut tallies: BTreeMap<&str, WorkerTally> = BTreeMap::new();
    for record in records {
        if let Some(worker) = record.worker_id.as_deref() {
            let tally = tallies.entry(worker).or_default();
            tally.wins += 1;
            tally.confidence_sum += record.confidence;
        }
    }
    for (worker, tally) in &tallies {
        println!(
            "  {worker}: {} win(s), mean confidence {:.3}",
            tally.wins,
            tally.confidence_sum / tally.wins as f64
        );
    }

    if limit > 0 {
        println!("Most recent:");
        for record in records.iter().rev().take(limit) {
            let pattern = record
                .pattern
                .map_or_else(|| "-".to_string(), |p| p.to_string());
            println!(
                "  {} {} {} worker={} confidence={:.3} attempts={} errors={}",
                record.recorded_at.to_rfc3339(),
                record.task_id,
                pattern,
                record.worker_id.as_deref().unwrap_or("-"),
                record.confidence,
                record.attempts,
                record.errors
            );
        }
    }
}
