use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use doc_host::config::{DocHostConfig, EngineConfig, TimeUpdateConfig};
use doc_host::engine::ProcessEngineFactory;
use doc_host::placement::{
    load_reports, load_reports_file, pick_worker, rank_workers, ScoredWorker, WorkerLoadReport,
};
use doc_host::DocRegistry;

#[derive(Parser, Debug)]
#[command(name = "doc-host")]
#[command(version)]
#[command(about = "Hosts open spreadsheet documents, each with its own calculation engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a document host
    Serve(ServeArgs),

    /// Choose a worker for a new document from load reports
    PickWorker(PickWorkerArgs),
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Engine executable; the document id is passed as its last argument
    #[arg(long, default_value = "python3")]
    engine_cmd: String,

    /// Engine arguments (comma-separated)
    #[arg(long, default_value = "-u,-m,sandbox", allow_hyphen_values = true)]
    engine_args: String,

    /// Documents to open at startup (comma-separated)
    #[arg(long, default_value = "")]
    preload: String,

    /// Idle time before a document with no clients is shut down
    #[arg(long, default_value = "30000")]
    inactivity_timeout_ms: u64,

    /// Time allowed for in-flight edits during a graceful shutdown
    #[arg(long, default_value = "10000")]
    grace_period_ms: u64,

    /// Time allowed for each shutdown step before the engine counts as hung
    #[arg(long, default_value = "5000")]
    shutdown_item_timeout_ms: u64,

    /// Delay before a hung engine is killed
    #[arg(long, default_value = "1000")]
    kill_delay_ms: u64,

    /// Time allowed for an engine to start
    #[arg(long, default_value = "30000")]
    load_timeout_ms: u64,

    /// Interval between pushes of the current time into each engine
    #[arg(long, default_value = "60000")]
    time_update_delay_ms: u64,

    /// Random extra delay added to each time push
    #[arg(long, default_value = "1000")]
    time_update_variance_ms: u64,

    /// Disable periodic time pushes
    #[arg(long)]
    no_time_updates: bool,

    /// Seconds between status log lines
    #[arg(long, default_value = "60")]
    status_interval_secs: u64,
}

impl ServeArgs {
    fn to_config(&self) -> DocHostConfig {
        DocHostConfig {
            inactivity_timeout_ms: self.inactivity_timeout_ms,
            grace_period_ms: self.grace_period_ms,
            shutdown_item_timeout_ms: self.shutdown_item_timeout_ms,
            kill_delay_ms: self.kill_delay_ms,
            load_timeout_ms: self.load_timeout_ms,
            time_update: TimeUpdateConfig {
                enabled: !self.no_time_updates,
                delay_ms: self.time_update_delay_ms,
                variance_ms: self.time_update_variance_ms,
            },
            engine: EngineConfig {
                command: self.engine_cmd.clone(),
                args: split_list(&self.engine_args),
            },
        }
    }
}

// =============================================================================
// Pick-worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PickWorkerArgs {
    /// JSON file with an array of worker load reports ("-" for stdin)
    #[arg(long, default_value = "-")]
    reports: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct PickOutput {
    chosen: Option<ScoredWorker>,
    candidates: Vec<ScoredWorker>,
}

// =============================================================================
// Helpers
// =============================================================================

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Cancelled on SIGTERM or SIGINT.
fn install_shutdown_handler() -> Result<CancellationToken, Box<dyn std::error::Error>> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token_clone = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down documents");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down documents");
            }
        }
        token_clone.cancel();
    });

    Ok(token)
}

// =============================================================================
// Commands
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.to_config();
    tracing::info!(
        engine = %config.engine.command,
        inactivity_timeout_ms = config.inactivity_timeout_ms,
        grace_period_ms = config.grace_period_ms,
        shutdown_item_timeout_ms = config.shutdown_item_timeout_ms,
        "Starting document host"
    );

    let factory = Arc::new(ProcessEngineFactory::new(config.engine.clone()));
    let registry = DocRegistry::new(config, factory);
    let shutdown = install_shutdown_handler()?;

    for doc_id in split_list(&args.preload) {
        match registry.create_or_get_doc(&doc_id).await {
            Ok(_) => tracing::info!(doc_id = %doc_id, "Preloaded document"),
            Err(e) => tracing::warn!(doc_id = %doc_id, error = %e, "Failed to preload document"),
        }
    }

    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = status.tick() => {
                tracing::info!(open_docs = registry.num_open_docs(), "Document host status");
            }
        }
    }

    registry.shutdown_all().await;
    tracing::info!("Document host stopped");
    Ok(())
}

fn handle_pick_worker(args: PickWorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reports: Vec<WorkerLoadReport> = if args.reports.as_os_str() == "-" {
        load_reports(std::io::stdin().lock())?
    } else {
        load_reports_file(&args.reports)?
    };

    let chosen = pick_worker(&reports);
    let candidates = rank_workers(&reports);

    match args.output {
        OutputFormat::Json => {
            let output = PickOutput { chosen, candidates };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if candidates.is_empty() {
                println!("No candidate workers.");
                return Ok(());
            }
            println!("{:<3} {:<30} {:>8} {:>14} {:>8}", "", "WORKER", "SCORE", "FREE MB", "DOCS");
            println!("{}", "-".repeat(67));
            let chosen_id = chosen.as_ref().map(|w| w.worker_id().to_string());
            for worker in &candidates {
                let marker = if chosen_id.as_deref() == Some(worker.worker_id()) {
                    "*"
                } else {
                    ""
                };
                let (free, docs) = match &worker.report.load {
                    Some(load) => (
                        format!("{:.0}/{:.0}", load.free_memory_mb, load.total_memory_mb),
                        load.total_assignments_count.to_string(),
                    ),
                    None => ("unknown".to_string(), "-".to_string()),
                };
                println!(
                    "{:<3} {:<30} {:>8.4} {:>14} {:>8}",
                    marker,
                    worker.worker_id(),
                    worker.score,
                    free,
                    docs
                );
            }
        }
    }

    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::PickWorker(pick_args) => {
            handle_pick_worker(pick_args)?;
        }
    }

    Ok(())
}
