//! Command-line interface for the styleshot job service

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use styleshot_core::{
    init, version, AccountTier, AdmissionController, AppConfig, BackoffPolicy, Broker, Category,
    Channel, ConfigManager, CreditLedger, DatabaseConfig, DatabaseManager, DeadLetterHandler,
    JobPriority, JobSelectors, JobStatus, JobStore, Layout, LocalObjectStore, LogNotificationSink,
    MemoryCreditLedger, MemoryDeadLetterStore, MemoryJobStore, MockProvider, Pipeline,
    SubmitRequest, WorkerPool,
};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "styleshot")]
#[command(about = "Asynchronous image transformation job service")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job and process it with an in-process worker pool
    Submit {
        /// Source image path
        #[arg(short, long)]
        input: PathBuf,

        /// Ingress channel (telegram_bot, whatsapp_bot, discord_bot, web_app, mobile_app)
        #[arg(long, default_value = "web_app")]
        channel: String,

        /// Channel-native message id (required for bot channels)
        #[arg(long)]
        message_id: Option<String>,

        /// Client-supplied request id (direct channels; generated if omitted)
        #[arg(long)]
        request_id: Option<String>,

        /// Account identifier
        #[arg(long, default_value = "local")]
        account: String,

        /// Transformation category (clothing, portrait, product, pet)
        #[arg(long, default_value = "clothing")]
        category: String,

        /// Style preset name
        #[arg(long, default_value = "studio")]
        style: String,

        /// Output layout (square, portrait_4_5, story_9_16)
        #[arg(long, default_value = "square")]
        layout: String,

        /// Priority class (low, normal, high)
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Process as an elevated-tier account (no watermark)
        #[arg(long)]
        premium: bool,

        /// Directory rendered variants are written to
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Run a worker pool against a SQLite job database until interrupted
    Worker {
        /// SQLite database path
        #[arg(short, long, default_value = "styleshot.db")]
        database: PathBuf,

        /// Directory rendered variants are written to
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Show a job record from a SQLite job database
    Status {
        /// Job id
        job_id: Uuid,

        /// SQLite database path
        #[arg(short, long, default_value = "styleshot.db")]
        database: PathBuf,
    },

    /// Show system information and configuration defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    init().await?;

    let config = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?.config().clone(),
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Submit {
            input,
            channel,
            message_id,
            request_id,
            account,
            category,
            style,
            layout,
            priority,
            premium,
            output_dir,
        } => {
            run_submit(
                config, input, channel, message_id, request_id, account, category, style, layout,
                priority, premium, output_dir,
            )
            .await
        }
        Commands::Worker {
            database,
            output_dir,
        } => run_worker(config, database, output_dir).await,
        Commands::Status { job_id, database } => run_status(job_id, database).await,
        Commands::Info => {
            println!("styleshot v{}", version());
            println!("Asynchronous image transformation job service");
            println!("\nSystem information:");
            println!("  CPU cores: {}", num_cpus::get());
            println!("  Platform: {}", std::env::consts::OS);
            println!("\nDefaults:");
            println!("  Worker concurrency: {}", config.worker.concurrency);
            println!("  Max attempts: {}", config.queue.max_attempts);
            println!("  Backoff table (ms): {:?}", config.queue.backoff_table_ms);
            println!(
                "  Compression target: {} KB",
                config.pipeline.compression.target_bytes / 1024
            );
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_submit(
    config: AppConfig,
    input: PathBuf,
    channel: String,
    message_id: Option<String>,
    request_id: Option<String>,
    account: String,
    category: String,
    style: String,
    layout: String,
    priority: String,
    premium: bool,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    if !input.exists() {
        bail!("input file {} does not exist", input.display());
    }

    let channel: Channel = channel.parse()?;
    let category: Category = category.parse()?;
    let layout: Layout = layout.parse()?;
    let priority: JobPriority = priority.parse()?;

    // A direct-client submission without an explicit request id gets a fresh
    // one; bot channels must carry their platform message id
    let request_id = if channel.requires_message_id() {
        request_id
    } else {
        Some(request_id.unwrap_or_else(|| Uuid::new_v4().to_string()))
    };

    let jobs = Arc::new(MemoryJobStore::new());
    let ledger = Arc::new(MemoryCreditLedger::new());
    let dead_letters = Arc::new(MemoryDeadLetterStore::new());
    let object_root = output_dir.unwrap_or_else(|| config.storage.root.clone());
    let object_store = Arc::new(LocalObjectStore::new(object_root.clone()));

    let handler = Arc::new(DeadLetterHandler::new(
        dead_letters,
        jobs.clone(),
        Arc::new(LogNotificationSink),
    ));
    let broker = Arc::new(Broker::new(
        &config.queue,
        BackoffPolicy::from_config(&config.queue),
        handler,
    ));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::new(MockProvider::new()),
        object_store,
    ));
    let pool = WorkerPool::new(&config.worker, broker.clone(), pipeline, jobs.clone());
    let admission = AdmissionController::new(
        jobs.clone(),
        ledger.clone(),
        broker,
        config.credits.clone(),
    );

    ledger.grant(&account, config.credits.cost_per_job).await;

    let mut selectors = JobSelectors::new(category, style);
    selectors.layout = layout;
    let outcome = admission
        .submit(SubmitRequest {
            channel,
            message_id,
            client_request_id: request_id,
            account_id: account.clone(),
            tier: if premium {
                AccountTier::Premium
            } else {
                AccountTier::Standard
            },
            selectors,
            source_path: input,
            priority,
        })
        .await?;
    let job_id = outcome.job().id;
    info!(%job_id, duplicate = outcome.is_duplicate(), "job admitted");

    pool.start().await;
    let job = wait_for_terminal(jobs.as_ref(), job_id, Duration::from_secs(300)).await?;
    pool.shutdown().await;

    match job.status {
        JobStatus::Completed => {
            println!("Job {} completed in {}ms", job_id, job.total_duration_ms);
            for (stage, ms) in &job.stage_durations {
                println!("  {:<24} {:>6}ms", stage, ms);
            }
            println!("Output written under {}", object_root.display());
        }
        JobStatus::Failed => {
            // The datastore's refund trigger fires on the failed transition;
            // the local composition plays that role here
            ledger.refund(job_id, config.credits.cost_per_job).await?;
            bail!(
                "job {} failed after {} attempts: {}",
                job_id,
                job.attempts,
                job.last_error_message.unwrap_or_default()
            );
        }
        other => bail!("job {} ended in unexpected status {:?}", job_id, other),
    }

    Ok(())
}

async fn run_worker(
    config: AppConfig,
    database: PathBuf,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let db = Arc::new(
        DatabaseManager::new(DatabaseConfig {
            database_url: format!("sqlite:{}", database.display()),
            ..DatabaseConfig::default()
        })
        .await?,
    );

    let object_root = output_dir.unwrap_or_else(|| config.storage.root.clone());
    let handler = Arc::new(DeadLetterHandler::new(
        db.clone() as Arc<dyn styleshot_core::DeadLetterStore>,
        db.clone() as Arc<dyn JobStore>,
        Arc::new(LogNotificationSink),
    ));
    let broker = Arc::new(Broker::new(
        &config.queue,
        BackoffPolicy::from_config(&config.queue),
        handler,
    ));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::new(MockProvider::new()),
        Arc::new(LocalObjectStore::new(object_root)),
    ));
    let pool = WorkerPool::new(
        &config.worker,
        broker,
        pipeline,
        db.clone() as Arc<dyn JobStore>,
    );

    pool.start().await;
    println!("Worker pool running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    pool.shutdown().await;
    Ok(())
}

async fn run_status(job_id: Uuid, database: PathBuf) -> Result<()> {
    let db = DatabaseManager::new(DatabaseConfig {
        database_url: format!("sqlite:{}", database.display()),
        ..DatabaseConfig::default()
    })
    .await?;

    match JobStore::get(&db, job_id).await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        None => bail!("job {} not found", job_id),
    }
}

async fn wait_for_terminal(
    jobs: &dyn JobStore,
    job_id: Uuid,
    timeout: Duration,
) -> Result<styleshot_core::Job> {
    let started = std::time::Instant::now();
    loop {
        let job = jobs
            .get(job_id)
            .await?
            .context("job disappeared from the store")?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if started.elapsed() > timeout {
            bail!("timed out waiting for job {}", job_id);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["styleshot", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_submit_requires_input() {
        let cli = Cli::try_parse_from(["styleshot", "submit"]);
        assert!(cli.is_err());
    }
}
