//! CLI command definitions for workq.
//!
//! The binary is an operator tool: it runs a worker pool with a simulated
//! handler, enqueues test jobs and inspects or purges the queue.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tracing::info;

use crate::config::QueueConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{Job, JobHandler, JobQueue, WorkerPool};

/// Default path of the configuration file.
const DEFAULT_CONFIG_PATH: &str = "workq.yaml";

/// Distributed at-least-once job queue on Redis.
#[derive(Parser)]
#[command(name = "workq")]
#[command(about = "Run workers and inspect a Redis-backed lease queue")]
#[command(version)]
#[command(
    long_about = "workq runs lease-based workers against a Redis job queue and inspects its state.\n\nJobs are claimed atomically, kept alive by heartbeats, reclaimed by the reaper when a worker dies, and fetched across priorities by weighted round-robin.\n\nExample usage:\n  workq enqueue --priority high --payload hello --count 10\n  workq run --workers 4\n  workq stats"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the YAML configuration file. Missing files fall back to defaults.
    #[arg(short, long, env = "WORKQ_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker pool with the simulated handler until interrupted.
    Run(RunArgs),

    /// Enqueue one or more jobs.
    Enqueue(EnqueueArgs),

    /// Show queue depths, oldest job age and live workers.
    Stats(OutputArgs),

    /// List dead-lettered jobs, newest first.
    #[command(name = "peek-dlq")]
    PeekDlq(PeekDlqArgs),

    /// Delete every dead-lettered job.
    #[command(name = "purge-dlq")]
    PurgeDlq(PurgeDlqArgs),

    /// Print Prometheus metrics with current queue depths.
    Metrics,
}

/// Arguments for `workq run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of fetch loops. Overrides `worker.count`.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Do not run the reaper in this process.
    #[arg(long)]
    pub no_reaper: bool,

    /// Do not run the scheduled mover in this process.
    #[arg(long)]
    pub no_mover: bool,
}

/// Arguments for `workq enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Priority class of the job.
    #[arg(short, long)]
    pub priority: String,

    /// Job payload. A payload containing "fail" makes the simulated handler fail.
    #[arg(long, default_value = "")]
    pub payload: String,

    /// Number of identical jobs to enqueue.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    /// Delay before the job becomes ready, in milliseconds.
    #[arg(long, default_value = "0")]
    pub delay_ms: u64,

    /// Retry budget. Defaults to `worker.max_attempts`.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Explicit job id (only with --count 1).
    #[arg(long)]
    pub id: Option<String>,
}

/// Output format flag shared by read-only commands.
#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `workq peek-dlq`.
#[derive(Parser, Debug)]
pub struct PeekDlqArgs {
    /// Maximum entries to list.
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: usize,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `workq purge-dlq`.
#[derive(Parser, Debug)]
pub struct PurgeDlqArgs {
    /// Confirm the purge.
    #[arg(long)]
    pub yes: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = QueueConfig::load(Path::new(&cli.config))?;
    match cli.command {
        Commands::Run(args) => run_workers_command(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Stats(args) => run_stats_command(config, args).await,
        Commands::PeekDlq(args) => run_peek_dlq_command(config, args).await,
        Commands::PurgeDlq(args) => run_purge_dlq_command(config, args).await,
        Commands::Metrics => run_metrics_command(config).await,
    }
}

// ============================================================================
// Simulated handler
// ============================================================================

/// Handler used by `workq run`: sleeps in proportion to the payload size and
/// fails when the payload contains "fail".
#[derive(Debug, Default)]
pub struct SimulatedHandler;

impl SimulatedHandler {
    /// One millisecond per KiB of payload, capped at one second.
    pub fn work_time(payload: &str) -> Duration {
        Duration::from_millis((payload.len() as u64 / 1024).min(1_000))
    }
}

#[async_trait]
impl JobHandler for SimulatedHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        tokio::time::sleep(Self::work_time(&job.payload)).await;
        if job.payload.contains("fail") {
            anyhow::bail!("simulated failure for job {}", job.id);
        }
        Ok(())
    }
}

// ============================================================================
// Command implementations
// ============================================================================

async fn run_workers_command(mut config: QueueConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.worker.count = workers;
    }
    if args.no_reaper {
        config.reaper.enabled = false;
    }
    if args.no_mover {
        config.mover.enabled = false;
    }
    init_metrics()?;

    let mut pool = WorkerPool::connect(config, Arc::new(SimulatedHandler)).await?;
    pool.start().await?;

    shutdown_signal().await;
    info!("Shutdown signal received");
    pool.shutdown().await?;

    let stats = pool.stats();
    println!("✓ Worker pool stopped");
    println!("  Completed:  {}", stats.jobs_completed);
    println!("  Failed:     {}", stats.jobs_failed);
    println!("  Duplicates: {}", stats.jobs_duplicate);
    println!("  Lost:       {}", stats.leases_lost);
    println!(
        "  Avg time:   {}ms",
        stats.average_job_duration.as_millis()
    );
    Ok(())
}

async fn run_enqueue_command(config: QueueConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    if args.count == 0 {
        anyhow::bail!("--count must be at least 1");
    }
    if args.id.is_some() && args.count > 1 {
        anyhow::bail!("--id can only be used with --count 1");
    }

    let queue = JobQueue::connect(&config).await?;
    let delay = Duration::from_millis(args.delay_ms);

    let mut jobs = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let mut job = queue.job(&args.priority, &args.payload).delayed_by(delay);
        if let Some(max_attempts) = args.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        if let Some(id) = &args.id {
            job = job.with_id(id);
        }
        jobs.push(job);
    }

    let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
    let enqueued = queue.enqueue_batch(jobs).await?;
    println!("✓ Enqueued {} job(s) at priority '{}'", enqueued, args.priority);
    for id in ids.iter().take(10) {
        println!("  {id}");
    }
    if ids.len() > 10 {
        println!("  ... and {} more", ids.len() - 10);
    }
    Ok(())
}

async fn run_stats_command(config: QueueConfig, args: OutputArgs) -> anyhow::Result<()> {
    let queue = JobQueue::connect(&config).await?;
    let stats = queue.stats().await?;

    if args.json {
        let priorities: Vec<_> = stats
            .priorities
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "ready": p.ready,
                    "scheduled": p.scheduled,
                    "oldest_age_ms": p.oldest_age.map(|d| d.as_millis() as u64),
                })
            })
            .collect();
        let output = json!({
            "priorities": priorities,
            "dead_letter": stats.dead_letter,
            "live_workers": stats.live_workers,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{:<12} {:>8} {:>10} {:>12}", "PRIORITY", "READY", "SCHEDULED", "OLDEST");
    for p in &stats.priorities {
        let oldest = p
            .oldest_age
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:>8} {:>10} {:>12}", p.name, p.ready, p.scheduled, oldest);
    }
    println!();
    println!("Dead letter:  {}", stats.dead_letter);
    println!("Live workers: {}", stats.live_workers);
    Ok(())
}

async fn run_peek_dlq_command(config: QueueConfig, args: PeekDlqArgs) -> anyhow::Result<()> {
    let queue = JobQueue::connect(&config).await?;
    let entries = queue.peek_dead_letter(args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Dead-letter queue is empty");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  {}  priority={} attempts={}/{}",
            entry.moved_at.to_rfc3339(),
            entry.job.id,
            entry.job.priority,
            entry.job.attempt_count,
            entry.job.max_attempts
        );
        println!("    error: {}", entry.error);
    }
    Ok(())
}

async fn run_purge_dlq_command(config: QueueConfig, args: PurgeDlqArgs) -> anyhow::Result<()> {
    if !args.yes {
        anyhow::bail!("refusing to purge the dead-letter queue without --yes");
    }
    let queue = JobQueue::connect(&config).await?;
    let removed = queue.purge_dead_letter().await?;
    println!("✓ Removed {removed} dead-letter entries");
    Ok(())
}

async fn run_metrics_command(config: QueueConfig) -> anyhow::Result<()> {
    init_metrics()?;
    let queue = JobQueue::connect(&config).await?;
    // Fills the depth gauges.
    queue.stats().await?;
    print!("{}", export_metrics());
    Ok(())
}

/// Waits for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
