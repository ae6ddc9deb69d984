//! stix-pipeline - telemetry ground-segment pipeline
//!
//! Ingests raw spacecraft telemetry into an archive of level binary
//! products and publishes finished products to the downstream archive.
//!
//! # Usage
//!
//! ```bash
//! # One-shot ingest of every raw file in the telemetry directory
//! stix-pipeline ingest
//!
//! # Watch the telemetry directory and ingest files as they arrive
//! stix-pipeline watch --start-with-unprocessed
//!
//! # Publish settled L1 products
//! stix-pipeline publish --include-levels L1 --waiting-period 14d
//! ```
//!
//! # Environment Variables
//!
//! - `STIX_PIPELINE_CONFIG`: Path to the TOML config (default: ./pipeline.toml)
//! - `RUST_LOG`: Logging filter (overrides `[logging] level`)

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stix_pipeline::config::{self, PipelineConfig};
use stix_pipeline::pipeline::{
    run_consumer, run_watcher, FileHandler, OrchestratorSettings, PipelineOrchestrator, TelemetryIngestStep,
    WatchSettings,
};
use stix_pipeline::products::{DecoderRegistry, KindRegistry, ProductArchive};
use stix_pipeline::publish::{
    find_candidates, parse_waiting_period, Blacklist, PublishConflictResolver, PublishSettings, SupplementReport,
};
use stix_pipeline::storage::{Ledgers, ProcessLock};
use stix_pipeline::types::ProductLevel;

/// sled database directory inside the ledger directory.
const LEDGER_DB: &str = "ledger.db";

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "stix-pipeline")]
#[command(about = "Telemetry ingest, product archive and publishing pipeline")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file
    #[arg(long, env = "STIX_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the ledger directory
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Override the product archive directory
    #[arg(long)]
    archive: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Ingest raw telemetry files into level binary products
    Ingest {
        /// Files to ingest (default: every matching file in the telemetry directory)
        files: Vec<PathBuf>,
        /// Abort on the first failing file
        #[arg(long)]
        stop_on_error: bool,
        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Watch the telemetry directory and ingest files as they settle
    Watch {
        /// Queue files already present at startup
        #[arg(long)]
        start_with_unprocessed: bool,
    },

    /// Publish archived products to the downstream archive
    Publish {
        #[arg(long)]
        target_dir: Option<PathBuf>,
        #[arg(long)]
        review_dir: Option<PathBuf>,
        /// Minimum age of a file, e.g. 14d, 12h, 0s
        #[arg(long)]
        waiting_period: Option<String>,
        /// Levels to publish, e.g. L1,L2
        #[arg(long, value_delimiter = ',')]
        include_levels: Option<Vec<ProductLevel>>,
        /// Product types to publish, e.g. ql,sci
        #[arg(long, value_delimiter = ',')]
        include_types: Option<Vec<String>>,
        /// `latest` or a version number
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        include_incomplete: bool,
        #[arg(long)]
        blacklist: Option<PathBuf>,
        #[arg(long)]
        supplement_report: Option<PathBuf>,
    },

    /// Load and validate the config, then print it
    ValidateConfig,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::load(),
    };
    if let Some(ledger) = &args.ledger {
        cfg.paths.ledger_dir.clone_from(ledger);
    }
    if let Some(archive) = &args.archive {
        cfg.paths.archive_dir.clone_from(archive);
    }

    init_logging(&cfg.logging);

    match args.command {
        SubCommand::ValidateConfig => {
            let source = args
                .config
                .clone()
                .or_else(|| Some(PathBuf::from(config::LOCAL_CONFIG)).filter(|p| p.exists()));
            if let Some(path) = source {
                for key in PipelineConfig::unknown_keys(&path)? {
                    eprintln!("warning: {}", key);
                }
            }
            cfg.validate()?;
            println!("{}", cfg.to_toml()?);
            Ok(())
        }
        SubCommand::Ingest {
            files,
            stop_on_error,
            workers,
        } => {
            if stop_on_error {
                cfg.pipeline.stop_on_error = true;
            }
            if let Some(workers) = workers {
                cfg.pipeline.workers = workers;
            }
            cfg.validate()?;
            run_ingest(&cfg, files)
        }
        SubCommand::Watch { start_with_unprocessed } => {
            if start_with_unprocessed {
                cfg.pipeline.start_with_unprocessed = true;
            }
            cfg.validate()?;
            run_watch(cfg).await
        }
        SubCommand::Publish {
            target_dir,
            review_dir,
            waiting_period,
            include_levels,
            include_types,
            version,
            include_incomplete,
            blacklist,
            supplement_report,
        } => {
            let p = &mut cfg.publish;
            if let Some(v) = target_dir {
                p.target_dir = v;
            }
            if let Some(v) = review_dir {
                p.review_dir = v;
            }
            if let Some(v) = waiting_period {
                p.waiting_period = v;
            }
            if let Some(v) = include_levels {
                p.include_levels = v;
            }
            if let Some(v) = include_types {
                p.include_types = v;
            }
            if let Some(v) = version {
                p.version = v;
            }
            if include_incomplete {
                p.include_incomplete = true;
            }
            if blacklist.is_some() {
                p.blacklist_file = blacklist;
            }
            if supplement_report.is_some() {
                p.supplement_report = supplement_report;
            }
            cfg.validate()?;
            run_publish(&cfg)
        }
    }
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

// ============================================================================
// Shared setup
// ============================================================================

/// Lock and open the ledgers. The lock must outlive every ledger user.
fn open_ledgers(cfg: &PipelineConfig) -> Result<(ProcessLock, Ledgers)> {
    let lock = ProcessLock::acquire(&cfg.paths.ledger_dir)?;
    let db_path = cfg.paths.ledger_dir.join(LEDGER_DB);
    let ledgers = Ledgers::open(&db_path)
        .with_context(|| format!("Failed to open ledgers at {}", db_path.display()))?;
    info!(path = %db_path.display(), "Ledgers opened");
    Ok((lock, ledgers))
}

fn ingest_step(cfg: &PipelineConfig) -> Result<TelemetryIngestStep> {
    let archive = Arc::new(ProductArchive::envelope(
        &cfg.paths.archive_dir,
        cfg.pipeline.product_version,
    ));
    let kinds = Arc::new(KindRegistry::build().context("Product kind table is ambiguous")?);
    Ok(TelemetryIngestStep::new(archive, kinds, DecoderRegistry::with_level_binary()))
}

fn orchestrator(cfg: &PipelineConfig, ledgers: &Ledgers) -> Result<PipelineOrchestrator> {
    let settings = OrchestratorSettings {
        workers: cfg.pipeline.workers,
        batch_size: cfg.pipeline.batch_size,
        stop_on_error: cfg.pipeline.stop_on_error,
    };
    Ok(PipelineOrchestrator::new(ledgers.processing.clone(), settings)?)
}

fn list_tm_files(dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Cannot list {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| pattern.is_match(n));
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// ============================================================================
// Subcommands
// ============================================================================

fn run_ingest(cfg: &PipelineConfig, files: Vec<PathBuf>) -> Result<()> {
    let (_lock, ledgers) = open_ledgers(cfg)?;
    let step = ingest_step(cfg)?;
    let orchestrator = orchestrator(cfg, &ledgers)?;

    let files = if files.is_empty() {
        let pattern = Regex::new(&cfg.pipeline.tm_file_pattern)?;
        list_tm_files(&cfg.paths.tm_dir, &pattern)?
    } else {
        files
    };
    info!(files = files.len(), "Ingest run starting");

    let summary = orchestrator.run(&step, &files)?;
    for (file, reason) in &summary.failed {
        warn!(file = %file.display(), reason = %reason, "File not ingested");
    }
    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        outputs = summary.outputs.len(),
        "Ingest run complete"
    );
    Ok(())
}

async fn run_watch(cfg: PipelineConfig) -> Result<()> {
    let (_lock, ledgers) = open_ledgers(&cfg)?;
    let step = Arc::new(ingest_step(&cfg)?);
    let orchestrator = Arc::new(orchestrator(&cfg, &ledgers)?);

    let handler: FileHandler = Arc::new(move |path: &Path| {
        let summary = orchestrator.run(step.as_ref(), &[path.to_path_buf()])?;
        if let Some((_, reason)) = summary.failed.first() {
            anyhow::bail!("{}", reason);
        }
        Ok(summary.outputs.len())
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, shutting down");
        shutdown.cancel();
    });

    let settings = WatchSettings {
        pattern: Regex::new(&cfg.pipeline.tm_file_pattern)?,
        poll_interval: cfg.pipeline.poll_interval(),
        settle: cfg.pipeline.settle(),
        start_with_unprocessed: cfg.pipeline.start_with_unprocessed,
    };
    let (tx, rx) = mpsc::channel(cfg.pipeline.queue_capacity);
    let watcher = tokio::spawn(run_watcher(cfg.paths.tm_dir.clone(), settings, tx, cancel.clone()));

    let stats = run_consumer(rx, handler, cfg.pipeline.stop_on_error, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = watcher.await {
        error!(error = %e, "Watcher task failed");
    }
    ledgers.flush()?;

    if cfg.pipeline.stop_on_error && stats.failed > 0 {
        anyhow::bail!("Stopped after {} failed file(s)", stats.failed);
    }
    Ok(())
}

fn run_publish(cfg: &PipelineConfig) -> Result<()> {
    let (_lock, ledgers) = open_ledgers(cfg)?;
    let archive = ProductArchive::envelope(&cfg.paths.archive_dir, cfg.pipeline.product_version);
    let filter = cfg.candidate_filter()?;
    info!(
        waiting_period = %cfg.publish.waiting_period,
        minimum_age_secs = parse_waiting_period(&cfg.publish.waiting_period)?.num_seconds(),
        "Looking for publish candidates"
    );
    let candidates = find_candidates(archive.root(), &filter, Utc::now())?;

    let settings = PublishSettings {
        target_dir: cfg.publish.target_dir.clone(),
        review_dir: cfg.publish.review_dir.clone(),
        max_supplements: cfg.publish.max_supplements,
        stop_on_error: cfg.pipeline.stop_on_error,
    };
    let mut resolver = PublishConflictResolver::new(&ledgers.publish, archive.format(), settings);
    if let Some(path) = &cfg.publish.blacklist_file {
        resolver = resolver.with_blacklist(Blacklist::load(path)?);
    }
    if let Some(path) = &cfg.publish.supplement_report {
        resolver = resolver.with_report(SupplementReport::new(path));
    }

    let summary = resolver.publish(&candidates)?;
    if summary.errors() > 0 {
        warn!(errors = summary.errors(), "Some candidates need manual review");
    }
    Ok(())
}
